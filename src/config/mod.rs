//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig (validated)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → server swaps the config and pushes limiter settings into the RateLimiter
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Breaker presets are data; `[breakers.<name>]` tables override single fields
//! - Breakers are built once at startup; only limiter and admin settings hot-reload
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BreakerOverride, ListenerConfig, LogFormat, ObservabilityConfig,
    RateLimitConfig, RetryConfig, ServiceConfig, TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
