//! In-memory [`QueueStore`] implementation.
//!
//! `MemoryStore` keeps every job in a single table guarded by one
//! `tokio::sync::RwLock`. Each mutation runs inside one write-lock critical section
//! with no await point between reading and writing, so concurrent callers observe
//! linearizable claims and an abandoned call is either fully applied or not at all.
//!
//! Useful for unit tests, local development and single-process deployments. Nothing
//! survives a restart.
//!
//! # Examples
//!
//! ```rust
//! use leasework::{QueueClient, QueueType, clock::MockClock, queue::memory::MemoryStore};
//! use chrono::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> leasework::Result<()> {
//! let clock = MockClock::new();
//! let client = QueueClient::new(MemoryStore::new()).with_clock(clock.clone());
//!
//! client.enqueue(QueueType::Import, &["file-7".to_string()], None, false).await?;
//! let first = client.dequeue(QueueType::Import, "worker-a", 30, None, false).await?.unwrap();
//!
//! // worker-a goes silent; once the lease lapses another worker takes over
//! clock.advance(Duration::seconds(30));
//! let second = client.dequeue(QueueType::Import, "worker-b", 30, None, false).await?.unwrap();
//! assert_eq!(first.id, second.id);
//! # Ok(())
//! # }
//! ```

use crate::{
    LeaseworkError, Result,
    job::{GroupId, JobId, JobInfo, JobStatus, QueueType},
    queue::{CancelSummary, CancelTarget, ClaimRequest, EnqueuedJob, JobSelector, QueueStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::RwLock;

#[derive(Debug)]
struct MemoryStorage {
    /// All jobs, ordered by id.
    jobs: BTreeMap<JobId, JobInfo>,
    /// Dedup index: (queue type, definition) -> job id.
    definitions: HashMap<(QueueType, String), JobId>,
    next_job_id: JobId,
    /// `None` once `GroupId::MAX` has been handed out.
    next_group_id: Option<GroupId>,
}

impl MemoryStorage {
    fn new() -> Self {
        Self {
            jobs: BTreeMap::new(),
            definitions: HashMap::new(),
            next_job_id: 1,
            next_group_id: Some(1),
        }
    }

    fn has_active_job(&self, queue_type: QueueType) -> bool {
        self.jobs
            .values()
            .any(|job| job.queue_type == queue_type && job.status.is_active())
    }

    fn mint_group_id(&mut self) -> Result<GroupId> {
        let id = self
            .next_group_id
            .ok_or_else(|| LeaseworkError::invalid("group ids exhausted"))?;
        self.next_group_id = id.checked_add(1);
        Ok(id)
    }

    /// Keep minted group ids clear of caller-supplied ones.
    fn observe_group_id(&mut self, group_id: GroupId) -> Result<()> {
        let after = group_id.checked_add(1).ok_or_else(|| {
            LeaseworkError::invalid(format!("group id {} leaves no room for further groups", group_id))
        })?;
        if self.next_group_id.is_some_and(|next| group_id >= next) {
            self.next_group_id = Some(after);
        }
        Ok(())
    }

    fn cancel_matching<F>(&mut self, now: DateTime<Utc>, mut matches: F) -> CancelSummary
    where
        F: FnMut(&JobInfo) -> bool,
    {
        let mut summary = CancelSummary::default();

        for job in self.jobs.values_mut().filter(|job| matches(&**job)) {
            match job.status {
                JobStatus::Created => {
                    job.status = JobStatus::Cancelled;
                    job.end_date = Some(now);
                    summary.cancelled += 1;
                }
                JobStatus::Running => {
                    job.cancel_requested = true;
                    summary.cancel_requested += 1;
                }
                _ => {}
            }
        }

        summary
    }
}

/// Thread-safe in-memory job store.
#[derive(Clone)]
pub struct MemoryStore {
    storage: Arc<RwLock<MemoryStorage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(MemoryStorage::new())),
        }
    }

    /// Number of stored jobs across every queue type.
    pub async fn len(&self) -> usize {
        self.storage.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.storage.read().await.jobs.is_empty()
    }

    /// Remove every job and reset the id counters.
    pub async fn clear(&self) {
        *self.storage.write().await = MemoryStorage::new();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn create_jobs(
        &self,
        queue_type: QueueType,
        definitions: &[String],
        group_id: Option<GroupId>,
        force_one_active_job_group: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<EnqueuedJob>> {
        let mut storage = self.storage.write().await;

        if force_one_active_job_group && storage.has_active_job(queue_type) {
            return Err(LeaseworkError::GroupAlreadyActive { queue_type });
        }

        let mut group_id = group_id;
        if let Some(id) = group_id {
            storage.observe_group_id(id)?;
        }

        let mut enqueued = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let key = (queue_type, definition.clone());

            if let Some(existing) = storage
                .definitions
                .get(&key)
                .and_then(|id| storage.jobs.get(id))
            {
                enqueued.push(EnqueuedJob {
                    job: existing.clone(),
                    created: false,
                });
                continue;
            }

            let group = match group_id {
                Some(id) => id,
                None => {
                    let minted = storage.mint_group_id()?;
                    group_id = Some(minted);
                    minted
                }
            };

            let id = storage.next_job_id;
            storage.next_job_id += 1;

            let job = JobInfo::new(id, group, queue_type, definition.clone(), now);
            storage.definitions.insert(key, id);
            storage.jobs.insert(id, job.clone());

            enqueued.push(EnqueuedJob { job, created: true });
        }

        Ok(enqueued)
    }

    async fn claim_job(
        &self,
        request: &ClaimRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobInfo>> {
        let mut storage = self.storage.write().await;

        let candidate = storage
            .jobs
            .values()
            .filter(|job| job.queue_type == request.queue_type)
            .filter(|job| request.job_id.is_none_or(|id| job.id == id))
            .find(|job| {
                job.is_claimable(now, request.heartbeat_timeout, request.check_timeout_jobs_only)
            })
            .map(|job| job.id);

        let Some(job) = candidate.and_then(|id| storage.jobs.get_mut(&id)) else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.heartbeat_date_time = now;
        job.version += 1;
        job.worker = Some(request.worker.to_string());
        job.heartbeat_timeout_sec = Some(request.heartbeat_timeout.num_seconds());
        if job.start_date.is_none() {
            job.start_date = Some(now);
        }

        Ok(Some(job.clone()))
    }

    async fn renew_lease(
        &self,
        job_id: JobId,
        version: i64,
        result: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        let mut storage = self.storage.write().await;

        match storage.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running && job.version == version => {
                job.heartbeat_date_time = now;
                job.result = result.map(str::to_string);
                Ok(Some(job.cancel_requested))
            }
            _ => Ok(None),
        }
    }

    async fn finalize_job(
        &self,
        job: &JobInfo,
        cascade: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<CancelSummary>> {
        let mut storage = self.storage.write().await;

        let group_id = match storage.jobs.get_mut(&job.id) {
            Some(stored) if stored.status == JobStatus::Running && stored.version == job.version => {
                stored.status = job.status;
                stored.result = job.result.clone();
                stored.end_date = Some(now);
                stored.group_id
            }
            _ => return Ok(None),
        };

        let summary = if cascade {
            let queue_type = job.queue_type;
            storage.cancel_matching(now, |sibling| {
                sibling.group_id == group_id && sibling.queue_type == queue_type
            })
        } else {
            CancelSummary::default()
        };

        Ok(Some(summary))
    }

    async fn cancel_jobs(
        &self,
        queue_type: QueueType,
        target: CancelTarget,
        now: DateTime<Utc>,
    ) -> Result<CancelSummary> {
        let mut storage = self.storage.write().await;

        let summary = storage.cancel_matching(now, |job| {
            job.queue_type == queue_type
                && match target {
                    CancelTarget::Job(id) => job.id == id,
                    CancelTarget::Group(group_id) => job.group_id == group_id,
                }
        });

        Ok(summary)
    }

    async fn fetch_jobs(
        &self,
        queue_type: QueueType,
        selector: JobSelector<'_>,
        include_definition: bool,
    ) -> Result<Vec<JobInfo>> {
        let storage = self.storage.read().await;

        let jobs = storage
            .jobs
            .values()
            .filter(|job| job.queue_type == queue_type)
            .filter(|job| match selector {
                JobSelector::Id(id) => job.id == id,
                JobSelector::Ids(ids) => ids.contains(&job.id),
                JobSelector::Group(group_id) => job.group_id == group_id,
                JobSelector::All => true,
            })
            .cloned()
            .map(|job| {
                if include_definition {
                    job
                } else {
                    job.without_definition()
                }
            })
            .collect();

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn defs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn claim(worker: &str, timeout_secs: i64) -> ClaimRequest<'_> {
        ClaimRequest {
            queue_type: QueueType::Export,
            worker,
            heartbeat_timeout: Duration::seconds(timeout_secs),
            job_id: None,
            check_timeout_jobs_only: false,
        }
    }

    #[tokio::test]
    async fn test_create_jobs_assigns_ids_and_shared_group() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let created = store
            .create_jobs(QueueType::Export, &defs(&["a", "b", "c"]), None, false, now)
            .await
            .unwrap();

        assert_eq!(created.len(), 3);
        assert!(created.iter().all(|e| e.created));
        assert_eq!(
            created.iter().map(|e| e.job.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let group = created[0].job.group_id;
        assert!(created.iter().all(|e| e.job.group_id == group));

        let next = store
            .create_jobs(QueueType::Export, &defs(&["d"]), None, false, now)
            .await
            .unwrap();
        assert_ne!(next[0].job.group_id, group);
    }

    #[tokio::test]
    async fn test_create_jobs_dedup_is_per_queue_type() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .create_jobs(QueueType::Export, &defs(&["same"]), None, false, now)
            .await
            .unwrap();
        let other = store
            .create_jobs(QueueType::Import, &defs(&["same"]), None, false, now)
            .await
            .unwrap();

        assert!(other[0].created);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_repeated_definition_within_call() {
        let store = MemoryStore::new();
        let created = store
            .create_jobs(QueueType::Export, &defs(&["x", "x"]), None, false, Utc::now())
            .await
            .unwrap();

        assert!(created[0].created);
        assert!(!created[1].created);
        assert_eq!(created[0].job.id, created[1].job.id);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_supplied_group_id_not_reused_by_minting() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .create_jobs(QueueType::Export, &defs(&["a"]), Some(10), false, now)
            .await
            .unwrap();
        let minted = store
            .create_jobs(QueueType::Export, &defs(&["b"]), None, false, now)
            .await
            .unwrap();

        assert!(minted[0].job.group_id > 10);
    }

    #[tokio::test]
    async fn test_group_ids_near_max() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let err = store
            .create_jobs(QueueType::Export, &defs(&["a"]), Some(GroupId::MAX), false, now)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseworkError::InvalidArgument { .. }));
        assert_eq!(store.len().await, 0);

        store
            .create_jobs(QueueType::Export, &defs(&["a"]), Some(GroupId::MAX - 1), false, now)
            .await
            .unwrap();
        let last = store
            .create_jobs(QueueType::Export, &defs(&["b"]), None, false, now)
            .await
            .unwrap();
        assert_eq!(last[0].job.group_id, GroupId::MAX);

        let err = store
            .create_jobs(QueueType::Export, &defs(&["c"]), None, false, now)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseworkError::InvalidArgument { .. }));

        // the store stays usable for existing groups
        let joined = store
            .create_jobs(QueueType::Export, &defs(&["d"]), Some(5), false, now)
            .await
            .unwrap();
        assert_eq!(joined[0].job.group_id, 5);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_force_one_active_group() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .create_jobs(QueueType::Export, &defs(&["a"]), None, true, now)
            .await
            .unwrap();

        let err = store
            .create_jobs(QueueType::Export, &defs(&["b"]), None, true, now)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseworkError::GroupAlreadyActive { .. }));
        assert_eq!(store.len().await, 1);

        // other queue types are unaffected
        store
            .create_jobs(QueueType::Import, &defs(&["b"]), None, true, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_claim_picks_lowest_id_and_sets_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_jobs(QueueType::Export, &defs(&["a", "b"]), None, false, now)
            .await
            .unwrap();

        let later = now + Duration::seconds(3);
        let job = store.claim_job(&claim("w1", 10), later).await.unwrap().unwrap();

        assert_eq!(job.id, 1);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.version, 1);
        assert_eq!(job.heartbeat_date_time, later);
        assert_eq!(job.start_date, Some(later));
        assert_eq!(job.worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_claim_specific_job() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_jobs(QueueType::Export, &defs(&["a", "b"]), None, false, now)
            .await
            .unwrap();

        let mut request = claim("w1", 10);
        request.job_id = Some(2);
        let job = store.claim_job(&request, now).await.unwrap().unwrap();
        assert_eq!(job.id, 2);

        assert!(store.claim_job(&request, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaim_keeps_start_date() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_jobs(QueueType::Export, &defs(&["a"]), None, false, now)
            .await
            .unwrap();

        let first = store.claim_job(&claim("w1", 10), now).await.unwrap().unwrap();

        let mut timeout_only = claim("w2", 10);
        timeout_only.check_timeout_jobs_only = true;
        assert!(store.claim_job(&timeout_only, now + Duration::seconds(9)).await.unwrap().is_none());

        let later = now + Duration::seconds(10);
        let second = store.claim_job(&timeout_only, later).await.unwrap().unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.start_date, first.start_date);
        assert_eq!(second.heartbeat_date_time, later);
    }

    #[tokio::test]
    async fn test_renew_lease_requires_matching_version() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_jobs(QueueType::Export, &defs(&["a"]), None, false, now)
            .await
            .unwrap();
        let job = store.claim_job(&claim("w1", 10), now).await.unwrap().unwrap();

        assert_eq!(store.renew_lease(job.id, job.version, Some("1/3"), now).await.unwrap(), Some(false));
        assert_eq!(store.renew_lease(job.id, job.version + 1, None, now).await.unwrap(), None);
        assert_eq!(store.renew_lease(999, 1, None, now).await.unwrap(), None);

        let stored = store
            .fetch_jobs(QueueType::Export, JobSelector::Id(job.id), true)
            .await
            .unwrap();
        assert_eq!(stored[0].result.as_deref(), Some("1/3"));
    }

    #[tokio::test]
    async fn test_finalize_with_cascade() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_jobs(QueueType::Export, &defs(&["a", "b", "c", "d"]), None, false, now)
            .await
            .unwrap();

        let failing = store.claim_job(&claim("w1", 10), now).await.unwrap().unwrap();
        let running = store.claim_job(&claim("w2", 10), now).await.unwrap().unwrap();
        let done = store.claim_job(&claim("w3", 10), now).await.unwrap().unwrap();
        store
            .finalize_job(&done.finish(JobStatus::Completed, None), false, now)
            .await
            .unwrap()
            .unwrap();

        let summary = store
            .finalize_job(&failing.finish(JobStatus::Failed, Some("boom".into())), true, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary, CancelSummary { cancelled: 1, cancel_requested: 1 });

        let jobs = store
            .fetch_jobs(QueueType::Export, JobSelector::All, false)
            .await
            .unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(!jobs[0].cancel_requested);
        assert_eq!(jobs[1].id, running.id);
        assert!(jobs[1].cancel_requested);
        assert_eq!(jobs[2].status, JobStatus::Completed);
        assert!(!jobs[2].cancel_requested);
        assert_eq!(jobs[3].status, JobStatus::Cancelled);
        assert_eq!(jobs[3].end_date, Some(now));
    }

    #[tokio::test]
    async fn test_finalize_twice_is_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_jobs(QueueType::Export, &defs(&["a"]), None, false, now)
            .await
            .unwrap();
        let job = store.claim_job(&claim("w1", 10), now).await.unwrap().unwrap();
        let finished = job.finish(JobStatus::Completed, Some("ok".into()));

        assert!(store.finalize_job(&finished, false, now).await.unwrap().is_some());
        assert!(store.finalize_job(&finished, false, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_scoped_to_queue_type() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_jobs(QueueType::Export, &defs(&["a"]), None, false, now)
            .await
            .unwrap();
        store
            .create_jobs(QueueType::Import, &defs(&["b"]), None, false, now)
            .await
            .unwrap();

        let wrong_type = store
            .fetch_jobs(QueueType::Import, JobSelector::Id(1), true)
            .await
            .unwrap();
        assert!(wrong_type.is_empty());

        let without_def = store
            .fetch_jobs(QueueType::Export, JobSelector::Ids(&[1, 2, 3]), false)
            .await
            .unwrap();
        assert_eq!(without_def.len(), 1);
        assert!(without_def[0].definition.is_none());
    }

    #[tokio::test]
    async fn test_clear_resets_counters() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_jobs(QueueType::Export, &defs(&["a", "b"]), None, false, now)
            .await
            .unwrap();
        store.clear().await;
        assert!(store.is_empty().await);

        let again = store
            .create_jobs(QueueType::Export, &defs(&["a"]), None, false, now)
            .await
            .unwrap();
        assert_eq!(again[0].job.id, 1);
        assert!(again[0].created);
    }
}
