//! Resilience core for a feed-aggregation service.
//!
//! Circuit breakers isolate failing dependencies, a retry executor rides out
//! transient failures, and an adaptive rate limiter protects the service from
//! inbound floods. The `feed-resilience` binary serves them behind an axum
//! router with health, metrics and admin endpoints.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::ServiceConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
