//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain requests → Stop observers → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Every background task (limiter observer, config reload loop) holds a
//!   child token and exits when it fires
//! - Draining has a deadline: in-flight requests get `shutdown_grace_secs`

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
