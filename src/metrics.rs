//! Prometheus counters for queue operations.
//!
//! [`QueueMetrics`] owns its own [`Registry`]; attach it to a client with
//! [`QueueClient::with_metrics`](crate::queue::QueueClient::with_metrics) and expose
//! [`QueueMetrics::gather_text`] from whatever HTTP endpoint the application runs.
//!
//! ```rust
//! use leasework::{QueueClient, metrics::QueueMetrics, queue::memory::MemoryStore};
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(QueueMetrics::new("leasework").unwrap());
//! let client = QueueClient::new(MemoryStore::new()).with_metrics(metrics.clone());
//! # let _ = client;
//! assert!(metrics.gather_text().is_ok());
//! ```

use crate::{
    LeaseworkError, Result,
    config::MetricsConfig,
    job::{JobStatus, QueueType},
    queue::CancelSummary,
};
use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};

pub struct QueueMetrics {
    registry: Registry,
    enqueued: CounterVec,
    claimed: CounterVec,
    heartbeats: CounterVec,
    completed: CounterVec,
    cancellations: CounterVec,
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics").finish_non_exhaustive()
    }
}

fn counter(
    registry: &Registry,
    namespace: &str,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<CounterVec> {
    let counter = CounterVec::new(Opts::new(name, help).namespace(namespace), labels).map_err(
        |e| LeaseworkError::Metrics {
            message: format!("Failed to create {} metric: {}", name, e),
        },
    )?;

    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| LeaseworkError::Metrics {
            message: format!("Failed to register {} with registry: {}", name, e),
        })?;

    Ok(counter)
}

impl QueueMetrics {
    /// Create the counters under `namespace` (e.g. `leasework_jobs_claimed_total`).
    pub fn new(namespace: &str) -> Result<Self> {
        let registry = Registry::new();

        let enqueued = counter(
            &registry,
            namespace,
            "jobs_enqueued_total",
            "Enqueue results per definition",
            &["queue_type", "outcome"],
        )?;
        let claimed = counter(
            &registry,
            namespace,
            "jobs_claimed_total",
            "Successful claims, fresh or after an expired lease",
            &["queue_type", "kind"],
        )?;
        let heartbeats = counter(
            &registry,
            namespace,
            "heartbeats_total",
            "Heartbeat outcomes",
            &["queue_type", "outcome"],
        )?;
        let completed = counter(
            &registry,
            namespace,
            "jobs_completed_total",
            "Jobs moved to a terminal status by their worker",
            &["queue_type", "status"],
        )?;
        let cancellations = counter(
            &registry,
            namespace,
            "cancellations_total",
            "Jobs affected by cancellations, directly or through a failure cascade",
            &["queue_type", "effect"],
        )?;

        Ok(Self {
            registry,
            enqueued,
            claimed,
            heartbeats,
            completed,
            cancellations,
        })
    }

    /// Counters under the configured namespace, or `None` when metrics are disabled.
    pub fn from_config(config: &MetricsConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(&config.namespace).map(Some)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_enqueued(&self, queue_type: QueueType, created: bool) {
        let outcome = if created { "created" } else { "deduplicated" };
        self.enqueued
            .with_label_values(&[queue_type.as_str(), outcome])
            .inc();
    }

    pub fn record_claimed(&self, queue_type: QueueType, reclaimed: bool) {
        let kind = if reclaimed { "reclaimed" } else { "fresh" };
        self.claimed
            .with_label_values(&[queue_type.as_str(), kind])
            .inc();
    }

    pub fn record_heartbeat(&self, queue_type: QueueType, outcome: &str) {
        self.heartbeats
            .with_label_values(&[queue_type.as_str(), outcome])
            .inc();
    }

    pub fn record_completed(&self, queue_type: QueueType, status: JobStatus) {
        self.completed
            .with_label_values(&[queue_type.as_str(), status.as_str()])
            .inc();
    }

    pub fn record_cancellations(&self, queue_type: QueueType, summary: &CancelSummary) {
        if summary.cancelled > 0 {
            self.cancellations
                .with_label_values(&[queue_type.as_str(), "cancelled"])
                .inc_by(summary.cancelled as f64);
        }
        if summary.cancel_requested > 0 {
            self.cancellations
                .with_label_values(&[queue_type.as_str(), "requested"])
                .inc_by(summary.cancel_requested as f64);
        }
    }

    /// Render every counter in the Prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| LeaseworkError::Metrics {
                message: format!("Failed to encode metrics: {}", e),
            })?;

        String::from_utf8(buffer).map_err(|e| LeaseworkError::Metrics {
            message: format!("Failed to convert metrics to string: {}", e),
        })
    }
}
