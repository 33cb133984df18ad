//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a dependency:
//!     → dependency.rs (named breaker + retry policy)
//!     → retries.rs (bounded attempts, backoff with jitter, cancellation)
//!     → circuit_breaker.rs (fail fast while the dependency is down)
//!     → the dependency itself
//! ```
//!
//! # Design Decisions
//! - One breaker per dependency, built once by registry.rs from presets.rs
//!   and config overrides
//! - Time comes from clock.rs so every state machine runs under a manual clock in tests
//! - Cancellation is never a dependency failure

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod dependency;
pub mod presets;
pub mod registry;
pub mod retries;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Outcome, Rejection};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use dependency::{DependencyError, ProtectedDependency};
pub use registry::DependencyRegistry;
pub use retries::{with_backoff, OpenCircuitBehavior, RetryError, RetryPolicy};
