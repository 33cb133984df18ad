//! Inbound admission control.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → http/middleware/rate_limit.rs (derive the client key)
//!     → rate_limit.rs (per-key window check)
//!     → degradation.rs (level and posture, advanced by samples)
//!     → 429 on denial, otherwise pass to the handler
//! ```
//!
//! # Design Decisions
//! - A denial is a decision, never an error
//! - Memory is bounded by `max_tracked_keys` regardless of traffic shape
//! - State is per process; nothing is shared across replicas

pub mod degradation;
pub mod rate_limit;

pub use degradation::{DegradationConfig, GlobalLoadSnapshot, LimiterPosture, PostureConfig};
pub use rate_limit::{Decision, LimiterStatus, RateLimiter, RateLimiterConfig};
