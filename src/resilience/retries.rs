//! Retry logic.
//!
//! # Responsibilities
//! - Run a fallible async operation up to `max_attempts` times
//! - Sleep with exponential backoff + jitter between attempts
//! - Stop early on success, on a non-retryable error, or on cancellation
//!
//! # Design Decisions
//! - The inter-attempt sleep blocks only the calling task and races the
//!   caller's cancellation token; cancellation is returned verbatim
//! - Retried operations must be idempotent by the caller's design
//! - A circuit breaker rejection is an ordinary error here; the
//!   open-circuit policy flag is applied by [`crate::resilience::dependency`]

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::observability::metrics::{NoopMetrics, SharedMetrics};
use crate::resilience::backoff::{base_delay, calculate_backoff};

/// What a retry loop does when the guarded breaker rejects a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenCircuitBehavior {
    /// Stop on the first rejection.
    #[default]
    Abort,
    /// Treat the rejection as a transient failure and keep backing off.
    KeepRetrying,
}

/// Errors returned by [`with_backoff`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    #[error("{operation} failed after {attempts} attempt(s)")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The error was classified as non-retryable.
    #[error("{operation} failed with a non-retryable error on attempt {attempts}")]
    Permanent {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The caller's token fired.
    #[error("{operation} cancelled after {attempts} attempt(s)")]
    Cancelled { operation: String, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Permanent { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last underlying error, if an attempt produced one.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Permanent { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { .. } => None,
        }
    }
}

type RetryablePredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Retry policy for errors of type `E`.
pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
    pub on_open_circuit: OpenCircuitBehavior,
    retryable: RetryablePredicate<E>,
    metrics: SharedMetrics,
}

impl<E: 'static> RetryPolicy<E> {
    /// Every error is retryable until told otherwise.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter_fraction: 0.1,
            on_open_circuit: OpenCircuitBehavior::default(),
            retryable: Arc::new(|_: &E| true),
            metrics: NoopMetrics::shared(),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            multiplier: config.multiplier,
            jitter_fraction: config.jitter_fraction,
            on_open_circuit: config.on_open_circuit,
            ..Self::new(
                config.max_attempts,
                Duration::from_millis(config.base_delay_ms),
                Duration::from_millis(config.max_delay_ms),
            )
        }
    }

    /// Classify errors; `false` stops the loop immediately.
    pub fn with_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    /// Same timing and metrics, different error type and classifier.
    pub fn map_retryable<E2, F>(&self, predicate: F) -> RetryPolicy<E2>
    where
        F: Fn(&E2) -> bool + Send + Sync + 'static,
    {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter_fraction: self.jitter_fraction,
            on_open_circuit: self.on_open_circuit,
            retryable: Arc::new(predicate),
            metrics: self.metrics.clone(),
        }
    }

    pub(crate) fn retryable_fn(&self) -> RetryablePredicate<E> {
        self.retryable.clone()
    }
}

impl<E> RetryPolicy<E> {
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction;
        self
    }

    pub fn with_open_circuit(mut self, behavior: OpenCircuitBehavior) -> Self {
        self.on_open_circuit = behavior;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn is_retryable(&self, error: &E) -> bool {
        (self.retryable)(error)
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        base_delay(attempt, self.base_delay, self.max_delay, self.multiplier)
    }

    /// Jittered delay after failed attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt,
            self.base_delay,
            self.max_delay,
            self.multiplier,
            self.jitter_fraction,
        )
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter_fraction: self.jitter_fraction,
            on_open_circuit: self.on_open_circuit,
            retryable: self.retryable.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("on_open_circuit", &self.on_open_circuit)
            .finish_non_exhaustive()
    }
}

impl<E: 'static> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `f` with bounded, cancellable exponential backoff.
///
/// Returns the first success, the cancellation error, the first
/// non-retryable error, or the last error once `max_attempts` is spent.
pub async fn with_backoff<T, E, F, Fut>(
    ctx: &CancellationToken,
    policy: &RetryPolicy<E>,
    operation: &str,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if ctx.is_cancelled() {
            return Err(RetryError::Cancelled {
                operation: operation.to_string(),
                attempts: attempt,
            });
        }

        attempt += 1;
        if attempt > 1 {
            policy.metrics.record_retry_attempt(operation);
        }

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }
            result = f() => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !policy.is_retryable(&error) {
            tracing::debug!(operation = %operation, attempt, "Non-retryable error, giving up");
            return Err(RetryError::Permanent {
                operation: operation.to_string(),
                attempts: attempt,
                source: error,
            });
        }

        if attempt >= max_attempts {
            tracing::warn!(operation = %operation, attempts = attempt, "Retries exhausted");
            return Err(RetryError::Exhausted {
                operation: operation.to_string(),
                attempts: attempt,
                source: error,
            });
        }

        let delay = policy.backoff(attempt);
        tracing::info!(operation = %operation, attempt, delay = ?delay, "Retrying after failure");

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
