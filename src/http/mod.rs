//! HTTP surface.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, trace, timeout layers)
//!     → middleware/rate_limit.rs (per-client admission on /api/*)
//!     → handlers (health, metrics, api, admin)
//!     → response.rs (429 / 503 mapping)
//!     → Send to client
//! ```

pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
