//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Breakers, retries and the rate limiter produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms on a private registry)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → GET /metrics (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - A metrics sink is passed into each component; there is no global recorder
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use metrics::{MetricsRecorder, NoopMetrics, PrometheusMetrics, SharedMetrics};
