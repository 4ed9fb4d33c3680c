//! # Leasework
//!
//! A durable job queue shared by many unreliable workers, coordinated only through
//! a persistent store and wall-clock leases.
//!
//! ## Features
//!
//! - **Leases and heartbeats**: a claimed job belongs to one worker while it keeps
//!   heartbeating; a silent worker's job is reclaimed once its lease times out
//! - **Lease tokens**: a worker that lost its lease can no longer write progress or
//!   a final status
//! - **Enqueue deduplication**: a definition already known to a queue type returns
//!   the existing job
//! - **Job groups**: jobs enqueued together share a group; a failure can cancel the
//!   rest of its group
//! - **Cooperative cancellation**: pending jobs are cancelled outright, running jobs
//!   see the request on their next heartbeat
//! - **Backends**: in-memory store, PostgreSQL store (feature `postgres`)
//! - **Monitoring**: Prometheus counters (feature `metrics`, enabled by default)
//!
//! ## Quick Start
//!
//! ```rust
//! use leasework::{JobStatus, QueueClient, QueueType, queue::memory::MemoryStore};
//!
//! # #[tokio::main]
//! # async fn main() -> leasework::Result<()> {
//! let client = QueueClient::new(MemoryStore::new());
//!
//! // three shards of one export, enqueued as one group
//! let shards: Vec<String> = (1..=3).map(|i| format!("orders/shard-{}", i)).collect();
//! let jobs = client.enqueue(QueueType::Export, &shards, None, false).await?;
//! assert!(jobs.iter().all(|job| job.group_id == jobs[0].group_id));
//!
//! // a worker claims one and fails it, cancelling the rest of the group
//! let job = client.dequeue(QueueType::Export, "worker-1", 60, None, false).await?.unwrap();
//! client
//!     .complete(&job.finish(JobStatus::Failed, Some("source unavailable".into())), true)
//!     .await?;
//!
//! let group = client.get_by_group_id(QueueType::Export, jobs[0].group_id, false).await?;
//! assert_eq!(group[1].status, JobStatus::Cancelled);
//! assert_eq!(group[2].status, JobStatus::Cancelled);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A [`JobInfo`] is created `Created`, becomes `Running` when a worker claims it and
//! ends `Completed`, `Failed` or `Cancelled`. Jobs never move backwards; a
//! `Running` job whose lease expired is claimed again as it is.
//!
//! ### Workers
//!
//! [`Worker`] runs the claim / heartbeat / complete protocol around a
//! [`JobHandler`](worker::JobHandler); [`WorkerPool`] runs several on tokio tasks.
//!
//! ### Stores
//!
//! [`QueueClient`] implements the queue contract over any
//! [`QueueStore`](queue::QueueStore).
//!
//! ## Feature Flags
//!
//! - `postgres`: PostgreSQL store, migrations and the `leasework` binary
//! - `metrics`: Prometheus counters (default)

pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod migrations;
pub mod queue;
pub mod retry;
pub mod worker;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use config::LeaseworkConfig;
pub use error::LeaseworkError;
pub use job::{GroupId, JobId, JobInfo, JobStatus, QueueType};
pub use queue::{CancelSummary, QueueClient, QueueStore};
pub use worker::{JobContext, JobOutcome, Worker, WorkerPool};

#[cfg(feature = "postgres")]
pub use queue::postgres::PostgresStore;

#[cfg(feature = "metrics")]
pub use metrics::QueueMetrics;

pub type Result<T> = std::result::Result<T, LeaseworkError>;
