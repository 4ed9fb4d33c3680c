//! Worker loop: claim, run, heartbeat, complete.
//!
//! A [`Worker`] polls one queue type. For every claimed job it runs the
//! [`JobHandler`] while a heartbeat ticker keeps the lease alive and publishes the
//! handler's progress. Cancellation reaches the handler through its [`JobContext`];
//! handlers are expected to check it between units of work and return early.
//!
//! When a heartbeat reports that the lease is gone (another worker reclaimed the
//! job) the handler future is dropped and the job is never completed by this worker.
//!
//! # Examples
//!
//! ```rust
//! use leasework::{
//!     JobStatus, QueueClient, QueueType,
//!     queue::memory::MemoryStore,
//!     worker::{JobHandler, JobOutcome, Worker},
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> leasework::Result<()> {
//! let client = QueueClient::new(MemoryStore::new());
//! client.enqueue(QueueType::Export, &["table-a".to_string()], None, false).await?;
//!
//! let handler: JobHandler = Arc::new(|job, ctx| {
//!     Box::pin(async move {
//!         ctx.set_progress("halfway");
//!         Ok(Some(format!("exported {}", job.definition.unwrap_or_default())))
//!     })
//! });
//!
//! let worker = Worker::new(client.clone(), QueueType::Export, "worker-1", handler);
//! assert_eq!(worker.run_once().await?, Some(JobOutcome::Completed));
//!
//! let jobs = client.get_by_queue_type(QueueType::Export, false).await?;
//! assert_eq!(jobs[0].status, JobStatus::Completed);
//! assert_eq!(jobs[0].result.as_deref(), Some("exported table-a"));
//! # Ok(())
//! # }
//! ```

use crate::{
    LeaseworkError, Result,
    config::WorkerConfig,
    job::{JobInfo, JobStatus, QueueType},
    queue::{QueueClient, QueueStore},
    retry::{RetryPolicy, retry_transient},
};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior, sleep},
};
use tracing::{debug, error, info, warn};

/// Runs one job. `Ok(result)` completes the job with that result; `Err` fails it
/// with the error message as its result.
pub type JobHandler = Arc<
    dyn Fn(JobInfo, JobContext) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send>>
        + Send
        + Sync,
>;

/// Handle shared between the worker loop and a running handler.
#[derive(Clone, Debug)]
pub struct JobContext {
    inner: Arc<ContextState>,
}

#[derive(Debug)]
struct ContextState {
    cancel: watch::Sender<bool>,
    progress: Mutex<Option<String>>,
}

impl JobContext {
    pub(crate) fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(ContextState {
                cancel,
                progress: Mutex::new(None),
            }),
        }
    }

    /// Whether a heartbeat has reported that cancellation was requested.
    pub fn is_cancel_requested(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.cancel.subscribe();
        // the sender lives as long as `self`, so this only returns on cancellation
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Progress checkpoint stored with the next heartbeat.
    pub fn set_progress(&self, progress: impl Into<String>) {
        *self
            .inner
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(progress.into());
    }

    pub fn progress(&self) -> Option<String> {
        self.inner
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn request_cancel(&self) -> bool {
        self.inner.cancel.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        })
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
    /// The lease was lost; another worker owns the job now.
    Abandoned,
}

enum Run {
    Finished(Result<Option<String>>),
    LeaseLost,
}

pub struct Worker<S: QueueStore> {
    client: QueueClient<S>,
    queue_type: QueueType,
    name: String,
    handler: JobHandler,
    poll_interval: Duration,
    heartbeat_timeout: Duration,
    heartbeat_interval: Option<Duration>,
    batch_size: usize,
    request_cancellation_on_failure: bool,
    retry: RetryPolicy,
}

impl<S: QueueStore> Clone for Worker<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            queue_type: self.queue_type,
            name: self.name.clone(),
            handler: self.handler.clone(),
            poll_interval: self.poll_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            heartbeat_interval: self.heartbeat_interval,
            batch_size: self.batch_size,
            request_cancellation_on_failure: self.request_cancellation_on_failure,
            retry: self.retry.clone(),
        }
    }
}

impl<S: QueueStore + 'static> Worker<S> {
    pub fn new(
        client: QueueClient<S>,
        queue_type: QueueType,
        name: impl Into<String>,
        handler: JobHandler,
    ) -> Self {
        let defaults = WorkerConfig::default();
        Self {
            client,
            queue_type,
            name: name.into(),
            handler,
            poll_interval: defaults.polling_interval,
            heartbeat_timeout: defaults.heartbeat_timeout,
            heartbeat_interval: None,
            batch_size: defaults.dequeue_batch_size,
            request_cancellation_on_failure: defaults.request_cancellation_on_failure,
            retry: defaults.retry,
        }
    }

    /// Build the `index`-th worker of a pool from validated configuration.
    ///
    /// The worker is named by [`WorkerConfig::worker_name`].
    pub fn from_config(
        client: QueueClient<S>,
        config: &WorkerConfig,
        index: usize,
        handler: JobHandler,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(client, config.queue_type, config.worker_name(index), handler)
            .with_poll_interval(config.polling_interval)
            .with_heartbeat_timeout(config.heartbeat_timeout)
            .with_heartbeat_interval(config.effective_heartbeat_interval())
            .with_batch_size(config.dequeue_batch_size)
            .with_cancellation_on_failure(config.request_cancellation_on_failure)
            .with_retry_policy(config.retry.clone()))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Lease length used when claiming. Rounded down to whole seconds, between one
    /// second and a year.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Heartbeat period; half the timeout when unset.
    ///
    /// An interval that would not beat before the lease expires is replaced by
    /// half the timeout when the worker runs.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Jobs claimed per poll. Jobs of one batch run concurrently.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_cancellation_on_failure(mut self, enabled: bool) -> Self {
        self.request_cancellation_on_failure = enabled;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn heartbeat_timeout_secs(&self) -> i64 {
        self.heartbeat_timeout.as_secs().clamp(1, MAX_LEASE.as_secs()) as i64
    }

    /// Lease length actually requested from the store.
    fn lease(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs() as u64)
    }

    fn heartbeat_interval(&self) -> Duration {
        let lease = self.lease();
        let interval = match self.heartbeat_interval {
            Some(interval) if interval < lease => interval,
            _ => lease / 2,
        };
        interval.max(Duration::from_millis(1))
    }

    /// Poll until a shutdown signal arrives or the sender is dropped.
    ///
    /// Jobs already claimed are finished before the loop exits.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(worker = %self.name, queue_type = %self.queue_type, "Worker started");
        if let Some(interval) = self.heartbeat_interval.filter(|i| *i >= self.lease()) {
            warn!(
                worker = %self.name,
                ?interval,
                lease = ?self.lease(),
                "Heartbeat interval does not fit the lease, beating at half the lease instead"
            );
        }

        loop {
            match shutdown_rx.try_recv() {
                Err(mpsc::error::TryRecvError::Empty) => {}
                _ => break,
            }

            let idle = match self.poll().await {
                Ok(processed) => processed == 0,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Error processing jobs");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(self.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.name, queue_type = %self.queue_type, "Worker stopped");
        Ok(())
    }

    /// Claim and process at most one job.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        match self
            .client
            .dequeue(self.queue_type, &self.name, self.heartbeat_timeout_secs(), None, false)
            .await?
        {
            Some(job) => self.process_job(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Claim up to `batch_size` jobs and process them. Returns how many were claimed.
    async fn poll(&self) -> Result<usize> {
        if self.batch_size <= 1 {
            return Ok(self.run_once().await?.map_or(0, |_| 1));
        }

        let jobs = self
            .client
            .dequeue_batch(
                self.queue_type,
                self.batch_size,
                &self.name,
                self.heartbeat_timeout_secs(),
            )
            .await?;
        let claimed = jobs.len();

        let mut tasks = JoinSet::new();
        for job in jobs {
            let worker = self.clone();
            tasks.spawn(async move { worker.process_job(job).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(worker = %self.name, error = %e, "Job processing failed"),
                Err(e) => {
                    return Err(LeaseworkError::Worker {
                        message: format!("Job task failed: {}", e),
                    });
                }
            }
        }

        Ok(claimed)
    }

    async fn process_job(&self, job: JobInfo) -> Result<JobOutcome> {
        if job.cancel_requested {
            info!(job_id = job.id, worker = %self.name, "Claimed job already has cancellation requested");
            return self.finish(&job, JobStatus::Cancelled, job.result.clone()).await;
        }

        debug!(job_id = job.id, group_id = job.group_id, worker = %self.name, "Processing job");

        let ctx = JobContext::new();
        let handler = (self.handler)(job.clone(), ctx.clone());
        tokio::pin!(handler);

        let period = self.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let run = loop {
            tokio::select! {
                result = &mut handler => break Run::Finished(result),
                _ = ticker.tick() => {
                    let progress = ctx.progress();
                    let beat = retry_transient(&self.retry, "heartbeat", || {
                        self.client.heartbeat(&job, progress.as_deref())
                    })
                    .await;

                    match beat {
                        Ok(true) => {
                            if ctx.request_cancel() {
                                info!(job_id = job.id, worker = %self.name, "Cancellation requested");
                            }
                        }
                        Ok(false) => {}
                        Err(e) if e.is_not_found() => break Run::LeaseLost,
                        Err(e) => {
                            warn!(job_id = job.id, worker = %self.name, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        };

        match run {
            Run::LeaseLost => {
                warn!(job_id = job.id, worker = %self.name, "Lease lost, abandoning job");
                Ok(JobOutcome::Abandoned)
            }
            Run::Finished(Ok(result)) => {
                let status = if ctx.is_cancel_requested() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Completed
                };
                self.finish(&job, status, result).await
            }
            Run::Finished(Err(e)) => {
                warn!(job_id = job.id, worker = %self.name, error = %e, "Job handler failed");
                self.finish(&job, JobStatus::Failed, Some(e.to_string())).await
            }
        }
    }

    async fn finish(
        &self,
        job: &JobInfo,
        status: JobStatus,
        result: Option<String>,
    ) -> Result<JobOutcome> {
        let finished = job.clone().finish(status, result);
        let cascade = self.request_cancellation_on_failure;

        match retry_transient(&self.retry, "complete", || {
            self.client.complete(&finished, cascade)
        })
        .await
        {
            Ok(()) => Ok(match status {
                JobStatus::Failed => JobOutcome::Failed,
                JobStatus::Cancelled => JobOutcome::Cancelled,
                _ => JobOutcome::Completed,
            }),
            Err(e) if e.is_not_found() => {
                warn!(job_id = job.id, worker = %self.name, "Lease lost before completion");
                Ok(JobOutcome::Abandoned)
            }
            Err(e) => Err(e),
        }
    }
}

/// Longest lease a worker requests.
const MAX_LEASE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A set of workers running on their own tokio tasks.
pub struct WorkerPool<S: QueueStore> {
    workers: Vec<Worker<S>>,
    shutdown_tx: Vec<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl<S: QueueStore + 'static> WorkerPool<S> {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            shutdown_tx: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// `config.pool_size` workers sharing `client` and `handler`.
    pub fn from_config(
        client: QueueClient<S>,
        config: &WorkerConfig,
        handler: JobHandler,
    ) -> Result<Self> {
        config.validate()?;
        let mut pool = Self::new();
        for index in 0..config.pool_size {
            pool.add_worker(Worker::from_config(
                client.clone(),
                config,
                index,
                handler.clone(),
            )?);
        }
        Ok(pool)
    }

    pub fn add_worker(&mut self, worker: Worker<S>) {
        self.workers.push(worker);
    }

    /// Workers added but not yet started plus workers running.
    pub fn len(&self) -> usize {
        self.workers.len() + self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn every added worker. Returns immediately.
    pub fn start(&mut self) {
        info!("Starting worker pool with {} workers", self.workers.len());

        for worker in self.workers.drain(..) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            self.shutdown_tx.push(shutdown_tx);

            self.handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(shutdown_rx).await {
                    error!("Worker error: {}", e);
                }
            }));
        }
    }

    /// Signal every worker to stop and wait for in-flight jobs to finish.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down worker pool");

        for tx in self.shutdown_tx.drain(..) {
            if tx.send(()).await.is_err() {
                warn!("Failed to send shutdown signal to worker");
            }
        }

        for handle in self.handles.drain(..) {
            handle.await.map_err(|e| LeaseworkError::Worker {
                message: format!("Worker task failed: {}", e),
            })?;
        }

        Ok(())
    }
}

impl<S: QueueStore + 'static> Default for WorkerPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryStore;

    fn handler_returning(result: Result<Option<String>>) -> JobHandler {
        let result = Arc::new(Mutex::new(Some(result)));
        Arc::new(move |_job, _ctx| {
            let result = result.lock().unwrap().take().unwrap_or(Ok(None));
            Box::pin(async move { result })
        })
    }

    async fn client_with(definitions: &[&str]) -> QueueClient<MemoryStore> {
        let client = QueueClient::new(MemoryStore::new());
        let defs: Vec<String> = definitions.iter().map(|d| d.to_string()).collect();
        client
            .enqueue(QueueType::Import, &defs, None, false)
            .await
            .unwrap();
        client
    }

    #[test]
    fn test_context_cancel_and_progress() {
        let ctx = JobContext::new();
        assert!(!ctx.is_cancel_requested());
        assert!(ctx.progress().is_none());

        ctx.set_progress("10/20");
        assert_eq!(ctx.progress().as_deref(), Some("10/20"));

        assert!(ctx.request_cancel());
        assert!(!ctx.request_cancel());
        assert!(ctx.clone().is_cancel_requested());
    }

    #[tokio::test]
    async fn test_context_cancelled_resolves() {
        let ctx = JobContext::new();
        let waiter = ctx.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        ctx.request_cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_once_empty_queue() {
        let client = QueueClient::new(MemoryStore::new());
        let worker = Worker::new(client, QueueType::Import, "w", handler_returning(Ok(None)));
        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_handler_cascades() {
        let client = client_with(&["a", "b"]).await;
        let worker = Worker::new(
            client.clone(),
            QueueType::Import,
            "w",
            handler_returning(Err(LeaseworkError::Worker {
                message: "disk full".to_string(),
            })),
        );

        assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Failed));

        let jobs = client.get_by_queue_type(QueueType::Import, false).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].result.as_deref(), Some("Worker error: disk full"));
        assert_eq!(jobs[1].status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failure_without_cascade() {
        let client = client_with(&["a", "b"]).await;
        let worker = Worker::new(
            client.clone(),
            QueueType::Import,
            "w",
            handler_returning(Err(LeaseworkError::Worker {
                message: "bad row".to_string(),
            })),
        )
        .with_cancellation_on_failure(false);

        worker.run_once().await.unwrap();

        let jobs = client.get_by_queue_type(QueueType::Import, false).await.unwrap();
        assert_eq!(jobs[1].status, JobStatus::Created);
    }

    #[tokio::test]
    async fn test_batch_poll_processes_concurrently() {
        let client = client_with(&["a", "b", "c"]).await;
        let worker = Worker::new(client.clone(), QueueType::Import, "w", handler_returning(Ok(None)))
            .with_batch_size(2);

        assert_eq!(worker.poll().await.unwrap(), 2);
        assert_eq!(worker.poll().await.unwrap(), 1);
        assert_eq!(worker.poll().await.unwrap(), 0);

        let jobs = client.get_by_queue_type(QueueType::Import, false).await.unwrap();
        assert!(jobs.iter().all(|job| job.status == JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid() {
        let client = QueueClient::new(MemoryStore::new());
        let config = WorkerConfig {
            heartbeat_interval: Some(Duration::from_secs(900)),
            ..Default::default()
        };
        assert!(Worker::from_config(client, &config, 0, handler_returning(Ok(None))).is_err());
    }

    #[tokio::test]
    async fn test_from_config_uses_configured_name() {
        let client = client_with(&["a"]).await;
        let config = WorkerConfig {
            name: Some("importer".to_string()),
            queue_type: QueueType::Import,
            pool_size: 1,
            heartbeat_timeout: Duration::from_secs(40),
            ..Default::default()
        };

        let worker = Worker::from_config(client.clone(), &config, 0, handler_returning(Ok(None))).unwrap();
        assert_eq!(worker.name(), "importer");
        assert_eq!(worker.heartbeat_interval(), Duration::from_secs(20));

        worker.run_once().await.unwrap();
        let jobs = client.get_by_queue_type(QueueType::Import, false).await.unwrap();
        assert_eq!(jobs[0].worker.as_deref(), Some("importer"));
        assert_eq!(jobs[0].heartbeat_timeout_sec, Some(40));
    }

    #[test]
    fn test_heartbeat_interval_stays_inside_lease() {
        let client = QueueClient::new(MemoryStore::new());
        let worker = Worker::new(client, QueueType::Import, "w", handler_returning(Ok(None)))
            .with_heartbeat_timeout(Duration::from_secs(10));
        assert_eq!(worker.heartbeat_interval(), Duration::from_secs(5));

        let short = worker.clone().with_heartbeat_interval(Duration::from_secs(3));
        assert_eq!(short.heartbeat_interval(), Duration::from_secs(3));

        let equal = worker.clone().with_heartbeat_interval(Duration::from_secs(10));
        assert_eq!(equal.heartbeat_interval(), Duration::from_secs(5));

        let longer = worker.clone().with_heartbeat_interval(Duration::from_secs(60));
        assert_eq!(longer.heartbeat_interval(), Duration::from_secs(5));

        // the timeout may be set after the interval
        let reordered = Worker::new(
            QueueClient::new(MemoryStore::new()),
            QueueType::Import,
            "w",
            handler_returning(Ok(None)),
        )
        .with_heartbeat_interval(Duration::from_secs(30))
        .with_heartbeat_timeout(Duration::from_secs(20));
        assert_eq!(reordered.heartbeat_interval(), Duration::from_secs(10));

        // sub-second timeouts are requested as one-second leases
        let tiny = worker
            .with_heartbeat_timeout(Duration::from_millis(200))
            .with_heartbeat_interval(Duration::from_millis(700));
        assert_eq!(tiny.heartbeat_interval(), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_huge_heartbeat_timeout_still_claims() {
        let client = client_with(&["a"]).await;
        let worker = Worker::new(client.clone(), QueueType::Import, "w", handler_returning(Ok(None)))
            .with_heartbeat_timeout(Duration::MAX);

        assert_eq!(worker.lease(), MAX_LEASE);
        assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Completed));
    }

    #[tokio::test]
    async fn test_unbounded_batch_size() {
        let client = client_with(&["a", "b", "c"]).await;
        let worker = Worker::new(client.clone(), QueueType::Import, "w", handler_returning(Ok(None)))
            .with_batch_size(usize::MAX);

        assert_eq!(worker.poll().await.unwrap(), 3);
        let jobs = client.get_by_queue_type(QueueType::Import, false).await.unwrap();
        assert!(jobs.iter().all(|job| job.status == JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_pool_from_config() {
        let client = client_with(&["a", "b", "c"]).await;
        let config = WorkerConfig {
            queue_type: QueueType::Import,
            pool_size: 3,
            polling_interval: Duration::from_millis(10),
            ..Default::default()
        };

        let mut pool = WorkerPool::from_config(client.clone(), &config, handler_returning(Ok(None))).unwrap();
        assert_eq!(pool.len(), 3);
        let names: Vec<&str> = pool.workers.iter().map(|w| w.name()).collect();
        assert_eq!(names, vec!["import-0", "import-1", "import-2"]);

        pool.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let jobs = client.get_by_queue_type(QueueType::Import, false).await.unwrap();
                if jobs.iter().all(|job| job.status.is_terminal()) {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        pool.shutdown().await.unwrap();

        let zero = WorkerConfig {
            pool_size: 0,
            ..config
        };
        assert!(WorkerPool::from_config(client, &zero, handler_returning(Ok(None))).is_err());
    }

    #[tokio::test]
    async fn test_pool_start_and_shutdown() {
        let client = client_with(&["a", "b", "c", "d"]).await;
        let mut pool = WorkerPool::new();
        for i in 0..2 {
            pool.add_worker(
                Worker::new(
                    client.clone(),
                    QueueType::Import,
                    format!("w{}", i),
                    handler_returning(Ok(None)),
                )
                .with_poll_interval(Duration::from_millis(10)),
            );
        }
        assert_eq!(pool.len(), 2);

        pool.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let jobs = client.get_by_queue_type(QueueType::Import, false).await.unwrap();
                if jobs.iter().all(|job| job.status.is_terminal()) {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        pool.shutdown().await.unwrap();
        assert!(pool.is_empty());
    }
}
