use crate::job::QueueType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseworkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The job does not exist, or is no longer held by the caller's lease.
    #[error("Job not found: {id}")]
    JobNotFound { id: i64 },

    #[error("An active job group already exists for queue type {queue_type}")]
    GroupAlreadyActive { queue_type: QueueType },

    #[error("Transient store error: {message}")]
    Transient { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LeaseworkError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        LeaseworkError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether the failure came from the store and may succeed if retried.
    ///
    /// A transient error never implies anything about the state of a job: the
    /// operation may or may not have been applied before the failure surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            LeaseworkError::Transient { .. } => true,
            LeaseworkError::Database(err) => is_transient_sqlx(err),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LeaseworkError::JobNotFound { .. })
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            // serialization_failure, deadlock_detected, too_many_connections, query_canceled
            Some("40001") | Some("40P01") | Some("53300") | Some("57014")
        ),
        _ => false,
    }
}

impl From<toml::de::Error> for LeaseworkError {
    fn from(err: toml::de::Error) -> Self {
        LeaseworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for LeaseworkError {
    fn from(err: toml::ser::Error) -> Self {
        LeaseworkError::Config(format!("TOML serialization error: {}", err))
    }
}
