//! Queue client and the store contract it runs on.
//!
//! [`QueueStore`] is the boundary to the persistence layer: it exposes the atomic
//! primitives the queue needs (create-if-absent by definition, select-and-claim,
//! conditional lease renewal, conditional terminal write, cancellation and reads).
//! [`QueueClient`] layers the queue contract on top of any conforming store:
//! argument validation, the clock, logging and metrics.
//!
//! Two stores ship with the crate: [`memory::MemoryStore`] (always available) and
//! `postgres::PostgresStore` (feature `postgres`).
//!
//! # Cancelling an in-flight call
//!
//! Every operation is an `async fn`. Dropping the returned future (for example
//! through `tokio::time::timeout` or a `tokio::select!` branch) abandons the call.
//! Stores commit each mutation atomically, so an abandoned call has either been
//! applied completely or not at all.

use crate::{
    LeaseworkError, Result,
    clock::{Clock, SystemClock},
    job::{GroupId, JobId, JobInfo, JobStatus, QueueType},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::QueueMetrics;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Parameters of a single claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub queue_type: QueueType,
    pub worker: &'a str,
    /// Lease window: a `Running` job whose last heartbeat is at least this old is
    /// reclaimable.
    pub heartbeat_timeout: chrono::Duration,
    /// Restrict the attempt to one job.
    pub job_id: Option<JobId>,
    /// Only consider `Running` jobs with an expired lease.
    pub check_timeout_jobs_only: bool,
}

/// Jobs targeted by a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    Job(JobId),
    Group(GroupId),
}

/// Jobs selected by a read.
#[derive(Debug, Clone, Copy)]
pub enum JobSelector<'a> {
    Id(JobId),
    Ids(&'a [JobId]),
    Group(GroupId),
    All,
}

/// Effect of a cancellation (direct, by group, or cascaded from a failure).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelSummary {
    /// `Created` jobs moved straight to `Cancelled`.
    pub cancelled: u64,
    /// `Running` jobs whose `cancel_requested` flag was raised.
    pub cancel_requested: u64,
}

impl CancelSummary {
    pub fn is_empty(&self) -> bool {
        self.cancelled == 0 && self.cancel_requested == 0
    }
}

/// One entry of an enqueue result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedJob {
    pub job: JobInfo,
    /// `false` when an existing record with the same definition was returned.
    pub created: bool,
}

/// Persistence contract for the job queue.
///
/// Every mutating method must be atomic with respect to every other call on the
/// same store: two racing callers produce one winner and one no-op, never two
/// owners. `now` is supplied by the caller so all comparisons inside one call use
/// the same instant.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Create one `Created` record per definition that does not yet exist in
    /// `queue_type`, returning existing records unchanged for the others.
    ///
    /// New records share `group_id` when given, otherwise one freshly minted group
    /// id. With `force_one_active_job_group`, fails with
    /// [`LeaseworkError::GroupAlreadyActive`] (creating nothing) when the queue type
    /// already holds a `Created` or `Running` job.
    async fn create_jobs(
        &self,
        queue_type: QueueType,
        definitions: &[String],
        group_id: Option<GroupId>,
        force_one_active_job_group: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<EnqueuedJob>>;

    /// Atomically select one claimable job and move it to `Running`, resetting its
    /// heartbeat, bumping its version and recording the worker.
    async fn claim_job(
        &self,
        request: &ClaimRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobInfo>>;

    /// Refresh the heartbeat and store `result` if the job is still `Running` under
    /// lease `version`. Returns the job's `cancel_requested`, or `None` when the
    /// lease is no longer held.
    async fn renew_lease(
        &self,
        job_id: JobId,
        version: i64,
        result: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>>;

    /// Write the terminal status and result of `job` if it is still `Running` under
    /// `job.version`. When `cascade` is set, cancel the rest of the group in the same
    /// atomic step. Returns `None` when the lease is no longer held.
    async fn finalize_job(
        &self,
        job: &JobInfo,
        cascade: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<CancelSummary>>;

    /// Cancel `Created` targets outright and flag `Running` ones.
    async fn cancel_jobs(
        &self,
        queue_type: QueueType,
        target: CancelTarget,
        now: DateTime<Utc>,
    ) -> Result<CancelSummary>;

    /// Read jobs of `queue_type` ordered by id.
    async fn fetch_jobs(
        &self,
        queue_type: QueueType,
        selector: JobSelector<'_>,
        include_definition: bool,
    ) -> Result<Vec<JobInfo>>;
}

/// The queue contract on top of a [`QueueStore`].
///
/// # Examples
///
/// ```rust
/// use leasework::{JobStatus, QueueClient, QueueType, queue::memory::MemoryStore};
///
/// # #[tokio::main]
/// # async fn main() -> leasework::Result<()> {
/// let client = QueueClient::new(MemoryStore::new());
///
/// let jobs = client
///     .enqueue(QueueType::Export, &["shard-1".to_string()], None, false)
///     .await?;
///
/// let job = client.dequeue(QueueType::Export, "worker-a", 60, None, false).await?.unwrap();
/// assert_eq!(job.id, jobs[0].id);
///
/// let cancel_requested = client.heartbeat(&job, Some("50%")).await?;
/// assert!(!cancel_requested);
///
/// client.complete(&job.finish(JobStatus::Completed, Some("done".into())), false).await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueClient<S: QueueStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<QueueMetrics>>,
}

impl<S: QueueStore> Clone for QueueClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: QueueStore> QueueClient<S> {
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Replace the wall clock, typically with a [`MockClock`](crate::clock::MockClock).
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Enqueue one job per definition.
    ///
    /// Definitions already present in `queue_type` return their existing record
    /// untouched. The result has one entry per input definition, in input order.
    ///
    /// A caller-supplied `group_id` must be below `i64::MAX`: the id allocator
    /// always advances past supplied ids, and nothing follows the maximum.
    pub async fn enqueue(
        &self,
        queue_type: QueueType,
        definitions: &[String],
        group_id: Option<GroupId>,
        force_one_active_job_group: bool,
    ) -> Result<Vec<JobInfo>> {
        queue_type.ensure_known()?;
        if group_id == Some(GroupId::MAX) {
            return Err(LeaseworkError::invalid(format!(
                "group id {} leaves no room for further groups",
                GroupId::MAX
            )));
        }
        if definitions.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let enqueued = self
            .store
            .create_jobs(
                queue_type,
                definitions,
                group_id,
                force_one_active_job_group,
                now,
            )
            .await?;

        let created = enqueued.iter().filter(|e| e.created).count();
        debug!(
            %queue_type,
            requested = definitions.len(),
            created,
            deduplicated = enqueued.len() - created,
            "Enqueued jobs"
        );

        Ok(enqueued
            .into_iter()
            .map(|entry| {
                self.record_enqueued(queue_type, entry.created);
                entry.job
            })
            .collect())
    }

    /// Claim one job, or return `None` when nothing is claimable.
    ///
    /// `job_id` restricts the attempt to a single job; `check_timeout_jobs_only`
    /// skips fresh `Created` jobs and only reclaims expired leases.
    ///
    /// The returned record carries the lease this call granted: a fresh
    /// `version`, `heartbeat_date_time` set to now and `heartbeat_timeout_sec`
    /// set to `heartbeat_timeout_sec`. [`JobInfo::lease_deadline`] combines the
    /// two.
    pub async fn dequeue(
        &self,
        queue_type: QueueType,
        worker: &str,
        heartbeat_timeout_sec: i64,
        job_id: Option<JobId>,
        check_timeout_jobs_only: bool,
    ) -> Result<Option<JobInfo>> {
        queue_type.ensure_known()?;
        let heartbeat_timeout = chrono::Duration::try_seconds(heartbeat_timeout_sec)
            .filter(|timeout| *timeout > chrono::Duration::zero())
            .ok_or_else(|| {
                LeaseworkError::invalid(format!(
                    "heartbeat timeout must be a positive number of seconds, got {}",
                    heartbeat_timeout_sec
                ))
            })?;

        let request = ClaimRequest {
            queue_type,
            worker,
            heartbeat_timeout,
            job_id,
            check_timeout_jobs_only,
        };
        let now = self.clock.now();

        let claimed = self.store.claim_job(&request, now).await?;
        match &claimed {
            Some(job) => {
                let reclaimed = job.version > 1;
                if reclaimed {
                    info!(
                        job_id = job.id,
                        group_id = job.group_id,
                        %queue_type,
                        worker,
                        version = job.version,
                        "Reclaimed job with expired lease"
                    );
                } else {
                    debug!(job_id = job.id, group_id = job.group_id, %queue_type, worker, "Claimed job");
                }
                self.record_claimed(queue_type, reclaimed);
            }
            None => debug!(%queue_type, worker, "No job available"),
        }

        Ok(claimed)
    }

    /// Claim up to `count` jobs, stopping as soon as the store has none left.
    pub async fn dequeue_batch(
        &self,
        queue_type: QueueType,
        count: usize,
        worker: &str,
        heartbeat_timeout_sec: i64,
    ) -> Result<Vec<JobInfo>> {
        // `count` is a ceiling, not a size hint
        let mut jobs = Vec::new();

        while jobs.len() < count {
            match self
                .dequeue(queue_type, worker, heartbeat_timeout_sec, None, false)
                .await?
            {
                Some(job) => jobs.push(job),
                None => break,
            }
        }

        Ok(jobs)
    }

    /// Prove liveness for a held job and checkpoint its progress.
    ///
    /// Returns whether cancellation has been requested. Fails with
    /// [`LeaseworkError::JobNotFound`] when the caller no longer holds the lease;
    /// the caller must then stop working on the job.
    pub async fn heartbeat(&self, job: &JobInfo, current_result: Option<&str>) -> Result<bool> {
        let now = self.clock.now();

        match self
            .store
            .renew_lease(job.id, job.version, current_result, now)
            .await?
        {
            Some(cancel_requested) => {
                debug!(job_id = job.id, cancel_requested, "Heartbeat accepted");
                self.record_heartbeat(
                    job.queue_type,
                    if cancel_requested { "cancel_requested" } else { "ok" },
                );
                Ok(cancel_requested)
            }
            None => {
                warn!(
                    job_id = job.id,
                    version = job.version,
                    "Heartbeat rejected, lease no longer held"
                );
                self.record_heartbeat(job.queue_type, "lost");
                Err(LeaseworkError::JobNotFound { id: job.id })
            }
        }
    }

    /// Record the final status and result carried by `job`.
    ///
    /// When the status is `Failed` and `request_cancellation_on_failure` is set, the
    /// rest of the group is cancelled: `Created` siblings become `Cancelled` and
    /// `Running` siblings are asked to stop.
    pub async fn complete(&self, job: &JobInfo, request_cancellation_on_failure: bool) -> Result<()> {
        if !job.status.is_terminal() {
            return Err(LeaseworkError::invalid(format!(
                "job {} must be completed with a terminal status, got {}",
                job.id, job.status
            )));
        }

        let cascade = request_cancellation_on_failure && job.status == JobStatus::Failed;
        let now = self.clock.now();

        let summary = self
            .store
            .finalize_job(job, cascade, now)
            .await?
            .ok_or(LeaseworkError::JobNotFound { id: job.id })?;

        info!(
            job_id = job.id,
            group_id = job.group_id,
            queue_type = %job.queue_type,
            status = %job.status,
            "Job finished"
        );
        self.record_completed(job.queue_type, job.status);

        if cascade {
            info!(
                group_id = job.group_id,
                cancelled = summary.cancelled,
                cancel_requested = summary.cancel_requested,
                "Cancelled job group after failure"
            );
            self.record_cancellations(job.queue_type, &summary);
        }

        Ok(())
    }

    /// Cancel one job. Unknown and already finished jobs are left alone.
    pub async fn cancel_by_id(&self, queue_type: QueueType, job_id: JobId) -> Result<CancelSummary> {
        self.cancel(queue_type, CancelTarget::Job(job_id)).await
    }

    /// Cancel every job of a group.
    pub async fn cancel_by_group_id(
        &self,
        queue_type: QueueType,
        group_id: GroupId,
    ) -> Result<CancelSummary> {
        self.cancel(queue_type, CancelTarget::Group(group_id)).await
    }

    async fn cancel(&self, queue_type: QueueType, target: CancelTarget) -> Result<CancelSummary> {
        queue_type.ensure_known()?;
        let now = self.clock.now();

        let summary = self.store.cancel_jobs(queue_type, target, now).await?;
        info!(
            %queue_type,
            ?target,
            cancelled = summary.cancelled,
            cancel_requested = summary.cancel_requested,
            "Cancellation applied"
        );
        self.record_cancellations(queue_type, &summary);

        Ok(summary)
    }

    pub async fn get_by_id(
        &self,
        queue_type: QueueType,
        job_id: JobId,
        include_definition: bool,
    ) -> Result<Option<JobInfo>> {
        let jobs = self
            .store
            .fetch_jobs(queue_type, JobSelector::Id(job_id), include_definition)
            .await?;
        Ok(jobs.into_iter().next())
    }

    pub async fn get_by_ids(
        &self,
        queue_type: QueueType,
        job_ids: &[JobId],
        include_definition: bool,
    ) -> Result<Vec<JobInfo>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .fetch_jobs(queue_type, JobSelector::Ids(job_ids), include_definition)
            .await
    }

    pub async fn get_by_group_id(
        &self,
        queue_type: QueueType,
        group_id: GroupId,
        include_definition: bool,
    ) -> Result<Vec<JobInfo>> {
        self.store
            .fetch_jobs(queue_type, JobSelector::Group(group_id), include_definition)
            .await
    }

    pub async fn get_by_queue_type(
        &self,
        queue_type: QueueType,
        include_definition: bool,
    ) -> Result<Vec<JobInfo>> {
        self.store
            .fetch_jobs(queue_type, JobSelector::All, include_definition)
            .await
    }

    #[cfg(feature = "metrics")]
    fn record_enqueued(&self, queue_type: QueueType, created: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_enqueued(queue_type, created);
        }
    }

    #[cfg(feature = "metrics")]
    fn record_claimed(&self, queue_type: QueueType, reclaimed: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_claimed(queue_type, reclaimed);
        }
    }

    #[cfg(feature = "metrics")]
    fn record_heartbeat(&self, queue_type: QueueType, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_heartbeat(queue_type, outcome);
        }
    }

    #[cfg(feature = "metrics")]
    fn record_completed(&self, queue_type: QueueType, status: JobStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_completed(queue_type, status);
        }
    }

    #[cfg(feature = "metrics")]
    fn record_cancellations(&self, queue_type: QueueType, summary: &CancelSummary) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cancellations(queue_type, summary);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_enqueued(&self, _queue_type: QueueType, _created: bool) {}

    #[cfg(not(feature = "metrics"))]
    fn record_claimed(&self, _queue_type: QueueType, _reclaimed: bool) {}

    #[cfg(not(feature = "metrics"))]
    fn record_heartbeat(&self, _queue_type: QueueType, _outcome: &str) {}

    #[cfg(not(feature = "metrics"))]
    fn record_completed(&self, _queue_type: QueueType, _status: JobStatus) {}

    #[cfg(not(feature = "metrics"))]
    fn record_cancellations(&self, _queue_type: QueueType, _summary: &CancelSummary) {}
}
