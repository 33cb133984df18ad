//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define the resilience metrics (admissions, check latency, tracked keys,
//!   breaker/limiter states, degradation level, evictions)
//! - Render a Prometheus-compatible exposition for the pull endpoint
//!
//! # Metrics
//! - `ratelimit_admissions_total` (counter): by limiter, path, outcome
//! - `ratelimit_check_duration_seconds` (summary): latency of `check` itself
//! - `ratelimit_tracked_keys` (gauge): keys currently held per limiter
//! - `ratelimit_degradation_level` (gauge): current degradation step
//! - `ratelimit_evictions_total` (counter): evicted key states
//! - `resilience_state` (gauge): 0=closed, 1=open, 2=half-open per component
//! - `circuit_breaker_calls_total` (counter): by breaker, outcome
//! - `retry_attempts_total` (counter): retried attempts per operation
//!
//! # Design Decisions
//! - Every [`PrometheusMetrics`] owns a private recorder; nothing is installed
//!   as the process-global recorder, so independent instances never collide
//! - [`NoopMetrics`] has the identical surface; call sites never branch on
//!   whether metrics are enabled

use std::fmt;
use std::sync::Arc;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// Observability sink shared by the breaker, retry executor and rate limiter.
pub trait MetricsRecorder: Send + Sync + fmt::Debug {
    /// Count one admission decision.
    fn record_admission(&self, limiter: &str, path: &str, allowed: bool);

    /// Observe how long an admission check took.
    fn observe_check_latency(&self, limiter: &str, seconds: f64);

    /// Set the number of keys a limiter currently tracks.
    fn set_tracked_keys(&self, limiter: &str, count: usize);

    /// Record a breaker-style state (`closed`, `open`, `half_open`).
    fn record_state(&self, component: &str, state: &str);

    /// Record the current degradation level of a limiter.
    fn set_degradation_level(&self, limiter: &str, level: usize);

    /// Count evicted key states.
    fn record_evictions(&self, limiter: &str, count: u64);

    /// Count one circuit breaker call outcome (`success`, `failure`, `rejected`, `cancelled`).
    fn record_breaker_outcome(&self, breaker: &str, outcome: &str);

    /// Count one retried attempt.
    fn record_retry_attempt(&self, operation: &str);
}

/// Shared handle to a metrics sink.
pub type SharedMetrics = Arc<dyn MetricsRecorder>;

/// Map a state name to its gauge ordinal. Unknown names read as closed.
pub fn state_ordinal(state: &str) -> f64 {
    match state {
        "open" => 1.0,
        "half_open" | "half-open" | "halfopen" => 2.0,
        _ => 0.0,
    }
}

fn sanitize_seconds(seconds: f64) -> f64 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.0
    }
}

/// Prometheus-backed recorder with its own registry.
pub struct PrometheusMetrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl PrometheusMetrics {
    /// Build an isolated recorder and register metric descriptions on it.
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe_counter!("ratelimit_admissions_total", "Admission decisions by outcome");
            describe_histogram!(
                "ratelimit_check_duration_seconds",
                Unit::Seconds,
                "Latency of the admission check"
            );
            describe_gauge!("ratelimit_tracked_keys", "Keys currently tracked by the limiter");
            describe_gauge!("ratelimit_degradation_level", "Current degradation level");
            describe_counter!("ratelimit_evictions_total", "Evicted per-key states");
            describe_gauge!("resilience_state", "0=closed, 1=open, 2=half-open");
            describe_counter!("circuit_breaker_calls_total", "Circuit breaker call outcomes");
            describe_counter!("retry_attempts_total", "Retried attempts per operation");
        });

        Self { recorder, handle }
    }

    /// Shared handle, ready to pass to components.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Render everything recorded so far in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl MetricsRecorder for PrometheusMetrics {
    fn record_admission(&self, limiter: &str, path: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        metrics::with_local_recorder(&self.recorder, || {
            counter!(
                "ratelimit_admissions_total",
                "limiter" => limiter.to_owned(),
                "path" => path.to_owned(),
                "outcome" => outcome
            )
            .increment(1);
        });
    }

    fn observe_check_latency(&self, limiter: &str, seconds: f64) {
        let seconds = sanitize_seconds(seconds);
        metrics::with_local_recorder(&self.recorder, || {
            histogram!("ratelimit_check_duration_seconds", "limiter" => limiter.to_owned())
                .record(seconds);
        });
    }

    fn set_tracked_keys(&self, limiter: &str, count: usize) {
        metrics::with_local_recorder(&self.recorder, || {
            gauge!("ratelimit_tracked_keys", "limiter" => limiter.to_owned()).set(count as f64);
        });
    }

    fn record_state(&self, component: &str, state: &str) {
        let ordinal = state_ordinal(state);
        metrics::with_local_recorder(&self.recorder, || {
            gauge!("resilience_state", "component" => component.to_owned()).set(ordinal);
        });
    }

    fn set_degradation_level(&self, limiter: &str, level: usize) {
        metrics::with_local_recorder(&self.recorder, || {
            gauge!("ratelimit_degradation_level", "limiter" => limiter.to_owned())
                .set(level as f64);
        });
    }

    fn record_evictions(&self, limiter: &str, count: u64) {
        if count == 0 {
            return;
        }
        metrics::with_local_recorder(&self.recorder, || {
            counter!("ratelimit_evictions_total", "limiter" => limiter.to_owned()).increment(count);
        });
    }

    fn record_breaker_outcome(&self, breaker: &str, outcome: &str) {
        metrics::with_local_recorder(&self.recorder, || {
            counter!(
                "circuit_breaker_calls_total",
                "breaker" => breaker.to_owned(),
                "outcome" => outcome.to_owned()
            )
            .increment(1);
        });
    }

    fn record_retry_attempt(&self, operation: &str) {
        metrics::with_local_recorder(&self.recorder, || {
            counter!("retry_attempts_total", "operation" => operation.to_owned()).increment(1);
        });
    }
}

/// Discarding recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl NoopMetrics {
    pub fn shared() -> SharedMetrics {
        Arc::new(NoopMetrics)
    }
}

impl MetricsRecorder for NoopMetrics {
    fn record_admission(&self, _limiter: &str, _path: &str, _allowed: bool) {}
    fn observe_check_latency(&self, _limiter: &str, _seconds: f64) {}
    fn set_tracked_keys(&self, _limiter: &str, _count: usize) {}
    fn record_state(&self, _component: &str, _state: &str) {}
    fn set_degradation_level(&self, _limiter: &str, _level: usize) {}
    fn record_evictions(&self, _limiter: &str, _count: u64) {}
    fn record_breaker_outcome(&self, _breaker: &str, _outcome: &str) {}
    fn record_retry_attempt(&self, _operation: &str) {}
}
