//! Retrying store calls that failed transiently.
//!
//! The queue client never retries on its own: a transient failure says nothing about
//! whether the operation was applied. Callers that know an operation is safe to
//! repeat (the worker loop's heartbeats and completions are conditional on the lease
//! version, so a duplicate is either a no-op or reported as a lost lease) wrap it in
//! [`retry_transient`].
//!
//! # Examples
//!
//! ```rust
//! use leasework::retry::{Backoff, JitterType, RetryPolicy};
//! use std::time::Duration;
//!
//! // 200ms, 400ms, 800ms ... capped at 5s, each ±10%
//! let policy = RetryPolicy::new(
//!     5,
//!     Backoff::Exponential {
//!         base: Duration::from_millis(200),
//!         multiplier: 2.0,
//!         max_delay: Duration::from_secs(5),
//!         jitter: Some(JitterType::Multiplicative(0.1)),
//!     },
//! );
//!
//! assert_eq!(policy.max_attempts, 5);
//! ```

use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tracing::warn;

/// Randomness applied to a backoff delay so that many workers hitting the same
/// failing store do not retry in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JitterType {
    /// `delay ± rand(0, amount)`
    Additive(Duration),

    /// `delay * (1 ± rand(0, factor))`
    Multiplicative(f64),
}

impl JitterType {
    /// Apply jitter to a delay. The result is never negative.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive(jitter_amount) => {
                let jitter_millis = rng.gen_range(0..=jitter_amount.as_millis() as u64);
                let jitter = Duration::from_millis(jitter_millis);

                if rng.gen_bool(0.5) {
                    delay + jitter
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative(factor) => {
                let factor = factor.abs().min(1.0);
                let jitter_factor = rng.gen_range((1.0 - factor)..=(1.0 + factor));
                let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
                Duration::from_millis(jittered_millis)
            }
        }
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(with = "crate::config::duration_secs")]
        delay: Duration,
    },
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    Exponential {
        #[serde(with = "crate::config::duration_secs")]
        base: Duration,
        multiplier: f64,
        #[serde(with = "crate::config::duration_secs")]
        max_delay: Duration,
        #[serde(default)]
        jitter: Option<JitterType>,
    },
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let uncapped = base.as_secs_f64() * multiplier.powi(exponent);
                let capped = if uncapped.is_finite() {
                    Duration::from_secs_f64(uncapped.max(0.0)).min(*max_delay)
                } else {
                    *max_delay
                };

                match jitter {
                    Some(jitter) => jitter.apply(capped),
                    None => capped,
                }
            }
        };

        delay.max(Duration::from_millis(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retrying.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run each operation exactly once.
    pub fn none() -> Self {
        Self::new(
            1,
            Backoff::Fixed {
                delay: Duration::from_millis(1),
            },
        )
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed { delay })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            Backoff::Exponential {
                base: Duration::from_millis(250),
                multiplier: 2.0,
                max_delay: Duration::from_secs(5),
                jitter: Some(JitterType::Multiplicative(0.1)),
            },
        )
    }
}

/// Run `operation`, retrying while it fails with a transient error and attempts
/// remain. Any other error, or the last transient one, is returned as is.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff.calculate_delay(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
