//! Configuration for queue clients, workers and binaries.
//!
//! Configuration loads from a TOML file, from `LEASEWORK_*` environment variables,
//! or from the `development()` / `production()` presets. Durations are written as
//! human-readable strings such as `"30s"`, `"5m"` or `"1h"`.
//!
//! ```toml
//! [database]
//! url = "postgresql://localhost/leasework"
//! pool_size = 10
//!
//! [worker]
//! queue_type = "export"
//! heartbeat_timeout = "10m"
//! polling_interval = "1s"
//!
//! [logging]
//! level = "info"
//! json_format = true
//! ```

use crate::{LeaseworkError, Result, job::QueueType, retry::RetryPolicy};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Serde adapter writing `std::time::Duration` as `"30s"`, `"5m"`, `"2h"` or `"1d"`.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub(crate) fn format_duration(duration: &Duration) -> String {
        let millis = duration.as_millis();
        if millis % 1000 != 0 {
            return format!("{}ms", millis);
        }

        let secs = duration.as_secs();
        if secs == 0 {
            "0s".to_string()
        } else if secs % 86400 == 0 {
            format!("{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parse a duration string like "30s", "5m", "1h", "250ms" or "90" (seconds).
    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(num_str) = s.strip_suffix("ms") {
            let num: u64 = num_str
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
            return Ok(Duration::from_millis(num));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        let unit: u64 = match suffix {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => {
                return Err(format!(
                    "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                    suffix
                ));
            }
        };

        num.checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Invalid number in duration: {}", num_str))
    }
}

/// Same as [`duration_secs`] for optional fields.
mod option_duration_secs {
    use super::duration_secs::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&format_duration(duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        Option::<String>::deserialize(deserializer)?
            .map(|s| parse_duration(&s).map_err(D::Error::custom))
            .transpose()
    }
}

/// Top-level configuration.
///
/// # Examples
///
/// ```rust
/// use leasework::{QueueType, config::LeaseworkConfig};
/// use std::time::Duration;
///
/// let config = LeaseworkConfig::new()
///     .with_database_url("postgresql://localhost/leasework")
///     .with_queue_type(QueueType::Defrag)
///     .with_heartbeat_timeout(Duration::from_secs(120));
///
/// assert_eq!(config.worker.effective_heartbeat_interval(), Duration::from_secs(60));
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LeaseworkConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl LeaseworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = url.to_string();
        self
    }

    pub fn with_database_pool_size(mut self, size: u32) -> Self {
        self.database.pool_size = size;
        self
    }

    pub fn with_queue_type(mut self, queue_type: QueueType) -> Self {
        self.worker.queue_type = queue_type;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker.pool_size = size;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.worker.heartbeat_timeout = timeout;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by `LEASEWORK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`. Unparseable values are configuration errors.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("LEASEWORK_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(pool_size) = lookup("LEASEWORK_DATABASE_POOL_SIZE") {
            self.database.pool_size = parse_env("LEASEWORK_DATABASE_POOL_SIZE", &pool_size)?;
        }
        if let Some(timeout) = lookup("LEASEWORK_DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout_secs =
                parse_env("LEASEWORK_DATABASE_CONNECTION_TIMEOUT", &timeout)?;
        }

        if let Some(name) = lookup("LEASEWORK_WORKER_NAME") {
            self.worker.name = Some(name);
        }
        if let Some(queue_type) = lookup("LEASEWORK_QUEUE_TYPE") {
            self.worker.queue_type = queue_type.parse()?;
        }
        if let Some(pool_size) = lookup("LEASEWORK_WORKER_POOL_SIZE") {
            self.worker.pool_size = parse_env("LEASEWORK_WORKER_POOL_SIZE", &pool_size)?;
        }
        if let Some(timeout) = lookup("LEASEWORK_HEARTBEAT_TIMEOUT") {
            self.worker.heartbeat_timeout = parse_env_duration("LEASEWORK_HEARTBEAT_TIMEOUT", &timeout)?;
        }
        if let Some(interval) = lookup("LEASEWORK_HEARTBEAT_INTERVAL") {
            self.worker.heartbeat_interval =
                Some(parse_env_duration("LEASEWORK_HEARTBEAT_INTERVAL", &interval)?);
        }
        if let Some(interval) = lookup("LEASEWORK_POLLING_INTERVAL") {
            self.worker.polling_interval = parse_env_duration("LEASEWORK_POLLING_INTERVAL", &interval)?;
        }

        if let Some(level) = lookup("LEASEWORK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("LEASEWORK_LOG_JSON") {
            self.logging.json_format = parse_env("LEASEWORK_LOG_JSON", &json)?;
        }

        if let Some(enabled) = lookup("LEASEWORK_METRICS_ENABLED") {
            self.metrics.enabled = parse_env("LEASEWORK_METRICS_ENABLED", &enabled)?;
        }
        if let Some(namespace) = lookup("LEASEWORK_METRICS_NAMESPACE") {
            self.metrics.namespace = namespace;
        }

        Ok(())
    }

    /// Reject settings the worker loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(LeaseworkError::Config(
                "database.pool_size must be at least 1".to_string(),
            ));
        }
        if self.database.connection_timeout_secs == 0 {
            return Err(LeaseworkError::Config(
                "database.connection_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.metrics.enabled && self.metrics.namespace.is_empty() {
            return Err(LeaseworkError::Config(
                "metrics.namespace must not be empty".to_string(),
            ));
        }
        self.worker.validate()
    }

    pub fn development() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/leasework_dev".to_string(),
                pool_size: 5,
                auto_migrate: true,
                ..Default::default()
            },
            worker: WorkerConfig {
                pool_size: 2,
                heartbeat_timeout: Duration::from_secs(30),
                polling_interval: Duration::from_millis(250),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            database: DatabaseConfig {
                pool_size: 20,
                connection_timeout_secs: 60,
                auto_migrate: false,
                ..Default::default()
            },
            worker: WorkerConfig {
                pool_size: 8,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                ..Default::default()
            },
            metrics: MetricsConfig {
                enabled: true,
                ..Default::default()
            },
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LeaseworkError::Config(format!("invalid value for {}: {}", key, value)))
}

fn parse_env_duration(key: &str, value: &str) -> Result<Duration> {
    duration_secs::parse_duration(value)
        .map_err(|e| LeaseworkError::Config(format!("invalid value for {}: {}", key, e)))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    /// Maximum connections held by the pool.
    pub pool_size: u32,
    /// How long to wait for a pooled connection before failing.
    pub connection_timeout_secs: u64,
    /// Run pending migrations on startup.
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/leasework".to_string(),
            pool_size: 10,
            connection_timeout_secs: 30,
            auto_migrate: false,
        }
    }
}

impl DatabaseConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker identity recorded on claimed jobs. See [`WorkerConfig::worker_name`].
    pub name: Option<String>,

    pub queue_type: QueueType,

    /// Number of workers in a pool
    pub pool_size: usize,

    /// Lease length: a job without a heartbeat for this long may be reclaimed.
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,

    /// Heartbeat period. Half the timeout when unset.
    #[serde(
        with = "option_duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat_interval: Option<Duration>,

    /// Sleep between polls when the queue is empty.
    #[serde(with = "duration_secs")]
    pub polling_interval: Duration,

    /// Jobs claimed per poll.
    pub dequeue_batch_size: usize,

    /// Cancel the rest of the group when a job fails.
    pub request_cancellation_on_failure: bool,

    /// Retry policy for transient store failures on heartbeat and completion.
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            queue_type: QueueType::Export,
            pool_size: 4,
            heartbeat_timeout: Duration::from_secs(600),
            heartbeat_interval: None,
            polling_interval: Duration::from_secs(1),
            dequeue_batch_size: 1,
            request_cancellation_on_failure: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Identity of the `index`-th worker of a pool built from this config.
    ///
    /// A configured `name` is used as is for a single worker and suffixed with
    /// the index when the pool has more than one.
    pub fn worker_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if self.pool_size <= 1 => name.clone(),
            Some(name) => format!("{}-{}", name, index),
            None => format!("{}-{}", self.queue_type, index),
        }
    }

    pub fn effective_heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
            .unwrap_or(self.heartbeat_timeout / 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_type == QueueType::Unknown {
            return Err(LeaseworkError::Config(
                "worker.queue_type must not be unknown".to_string(),
            ));
        }
        if self.heartbeat_timeout.as_secs() == 0 {
            return Err(LeaseworkError::Config(
                "worker.heartbeat_timeout must be at least one second".to_string(),
            ));
        }
        let interval = self.effective_heartbeat_interval();
        if interval.is_zero() || interval >= self.heartbeat_timeout {
            return Err(LeaseworkError::Config(format!(
                "worker.heartbeat_interval ({:?}) must be non-zero and shorter than heartbeat_timeout ({:?})",
                interval, self.heartbeat_timeout
            )));
        }
        if self.polling_interval.is_zero() {
            return Err(LeaseworkError::Config(
                "worker.polling_interval must be non-zero".to_string(),
            ));
        }
        if self.pool_size == 0 || self.dequeue_batch_size == 0 {
            return Err(LeaseworkError::Config(
                "worker.pool_size and worker.dequeue_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging and tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full `EnvFilter` directive
    pub level: String,

    /// Whether to enable structured JSON logging
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Prefix of every exported metric name.
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "leasework".to_string(),
        }
    }
}
