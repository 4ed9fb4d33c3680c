//! Job records and the status state machine.
//!
//! A [`JobInfo`] is the persistent unit of work tracked by the queue. Jobs are
//! partitioned by [`QueueType`] and move through [`JobStatus`] values:
//!
//! ```text
//! Created ──dequeue──▶ Running ──complete──▶ Completed | Failed | Cancelled
//!    │
//!    └──────cancel──────▶ Cancelled
//! ```
//!
//! A `Running` job is never moved back to `Created`; when its lease expires it
//! stays `Running` and is simply claimed again by another worker.

use crate::{LeaseworkError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub type JobId = i64;
pub type GroupId = i64;

/// Partition of the queue. Jobs are only ever compared and claimed within one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QueueType {
    /// Placeholder value; never valid for real work.
    Unknown = 0,
    Export = 1,
    Import = 2,
    Defrag = 3,
    BulkDelete = 4,
    BulkUpdate = 5,
}

impl QueueType {
    pub const ALL: [QueueType; 5] = [
        QueueType::Export,
        QueueType::Import,
        QueueType::Defrag,
        QueueType::BulkDelete,
        QueueType::BulkUpdate,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QueueType::Unknown),
            1 => Some(QueueType::Export),
            2 => Some(QueueType::Import),
            3 => Some(QueueType::Defrag),
            4 => Some(QueueType::BulkDelete),
            5 => Some(QueueType::BulkUpdate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueType::Unknown => "unknown",
            QueueType::Export => "export",
            QueueType::Import => "import",
            QueueType::Defrag => "defrag",
            QueueType::BulkDelete => "bulk_delete",
            QueueType::BulkUpdate => "bulk_update",
        }
    }

    /// Reject the `Unknown` placeholder before it reaches a store.
    pub(crate) fn ensure_known(self) -> Result<Self> {
        if self == QueueType::Unknown {
            return Err(LeaseworkError::invalid("queue type must not be Unknown"));
        }
        Ok(self)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = LeaseworkError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(value) = s.parse::<u8>() {
            return QueueType::from_u8(value)
                .ok_or_else(|| LeaseworkError::invalid(format!("unknown queue type: {}", s)));
        }
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "export" => Ok(QueueType::Export),
            "import" => Ok(QueueType::Import),
            "defrag" => Ok(QueueType::Defrag),
            "bulk_delete" | "bulkdelete" => Ok(QueueType::BulkDelete),
            "bulk_update" | "bulkupdate" => Ok(QueueType::BulkUpdate),
            _ => Err(LeaseworkError::invalid(format!("unknown queue type: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobStatus {
    Created = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(JobStatus::Created),
            1 => Some(JobStatus::Running),
            2 => Some(JobStatus::Completed),
            3 => Some(JobStatus::Failed),
            4 => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persistent job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub group_id: GroupId,
    pub queue_type: QueueType,
    /// Opaque work description. `None` when a lookup was asked to omit it.
    pub definition: Option<String>,
    pub status: JobStatus,
    /// Cooperative cancellation signal for a running job. Never cleared by the queue.
    pub cancel_requested: bool,
    /// Lease token, incremented by every successful claim.
    pub version: i64,
    /// Worker holding (or last holding) the lease.
    pub worker: Option<String>,
    pub create_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub heartbeat_date_time: DateTime<Utc>,
    /// Lease length in seconds requested by the claim that produced this record.
    /// `None` until the job is first claimed.
    #[serde(default)]
    pub heartbeat_timeout_sec: Option<i64>,
    pub result: Option<String>,
}

impl JobInfo {
    /// Build a fresh `Created` record. Stores assign the id.
    pub fn new(
        id: JobId,
        group_id: GroupId,
        queue_type: QueueType,
        definition: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            group_id,
            queue_type,
            definition: Some(definition),
            status: JobStatus::Created,
            cancel_requested: false,
            version: 0,
            worker: None,
            create_date: now,
            start_date: None,
            end_date: None,
            heartbeat_date_time: now,
            heartbeat_timeout_sec: None,
            result: None,
        }
    }

    /// Instant at which the current lease lapses unless a heartbeat renews it.
    pub fn lease_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.status, self.heartbeat_timeout_sec) {
            (JobStatus::Running, Some(secs)) => self
                .heartbeat_date_time
                .checked_add_signed(chrono::Duration::seconds(secs)),
            _ => None,
        }
    }

    /// Whether a `Running` job's lease has lapsed at `now` for the given timeout.
    ///
    /// The lease is valid while `now - heartbeat < timeout`; at exactly `timeout`
    /// the job becomes reclaimable.
    pub fn is_lease_expired(&self, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> bool {
        self.status == JobStatus::Running && now - self.heartbeat_date_time >= heartbeat_timeout
    }

    /// Whether a dequeue with these parameters may claim this job at `now`.
    pub fn is_claimable(
        &self,
        now: DateTime<Utc>,
        heartbeat_timeout: chrono::Duration,
        check_timeout_jobs_only: bool,
    ) -> bool {
        match self.status {
            JobStatus::Created => !check_timeout_jobs_only,
            JobStatus::Running => self.is_lease_expired(now, heartbeat_timeout),
            _ => false,
        }
    }

    /// Mark the job finished with the given terminal status and result.
    pub fn finish(mut self, status: JobStatus, result: Option<String>) -> Self {
        self.status = status;
        self.result = result;
        self
    }

    pub(crate) fn without_definition(mut self) -> Self {
        self.definition = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn running_job(heartbeat: DateTime<Utc>) -> JobInfo {
        let mut job = JobInfo::new(1, 1, QueueType::Export, "def".to_string(), heartbeat);
        job.status = JobStatus::Running;
        job
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Created.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Running.is_active());
    }

    #[test]
    fn test_status_storage_values() {
        for status in [
            JobStatus::Created,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_i16(status.as_i16()), Some(status));
        }
        assert_eq!(JobStatus::from_i16(9), None);
    }

    #[test]
    fn test_queue_type_parsing() {
        assert_eq!("export".parse::<QueueType>().unwrap(), QueueType::Export);
        assert_eq!("bulk-delete".parse::<QueueType>().unwrap(), QueueType::BulkDelete);
        assert_eq!("5".parse::<QueueType>().unwrap(), QueueType::BulkUpdate);
        assert!("reindex".parse::<QueueType>().is_err());
        assert!("42".parse::<QueueType>().is_err());
        assert_eq!(QueueType::BulkUpdate.to_string(), "bulk_update");
    }

    #[test]
    fn test_unknown_queue_type_rejected() {
        assert!(QueueType::Unknown.ensure_known().is_err());
        assert!(QueueType::Defrag.ensure_known().is_ok());
    }

    #[test]
    fn test_new_job_defaults() {
        let now = Utc::now();
        let job = JobInfo::new(3, 9, QueueType::Import, "payload".to_string(), now);
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.create_date, now);
        assert_eq!(job.heartbeat_date_time, now);
        assert_eq!(job.version, 0);
        assert!(!job.cancel_requested);
        assert!(job.start_date.is_none());
    }

    #[test]
    fn test_lease_expiry_boundary() {
        let start = Utc::now();
        let job = running_job(start);
        let timeout = Duration::seconds(10);

        assert!(!job.is_lease_expired(start + Duration::seconds(9), timeout));
        assert!(job.is_lease_expired(start + Duration::seconds(10), timeout));
        assert!(job.is_lease_expired(start + Duration::seconds(11), timeout));
    }

    #[test]
    fn test_lease_deadline() {
        let start = Utc::now();
        let mut job = running_job(start);
        assert_eq!(job.lease_deadline(), None);

        job.heartbeat_timeout_sec = Some(30);
        assert_eq!(job.lease_deadline(), Some(start + Duration::seconds(30)));

        let done = job.finish(JobStatus::Completed, None);
        assert_eq!(done.lease_deadline(), None);
    }

    #[test]
    fn test_claimability() {
        let now = Utc::now();
        let timeout = Duration::seconds(5);
        let created = JobInfo::new(1, 1, QueueType::Export, "a".to_string(), now);

        assert!(created.is_claimable(now, timeout, false));
        assert!(!created.is_claimable(now, timeout, true));

        let stale = running_job(now - Duration::seconds(6));
        assert!(stale.is_claimable(now, timeout, true));
        assert!(stale.is_claimable(now, timeout, false));

        let fresh = running_job(now);
        assert!(!fresh.is_claimable(now, timeout, false));

        let done = created.finish(JobStatus::Completed, None);
        assert!(!done.is_claimable(now, timeout, false));
    }
}
