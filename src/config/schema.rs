//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::presets;
use crate::resilience::retries::OpenCircuitBehavior;
use crate::security::rate_limit::RateLimiterConfig;

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Inbound rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Per-dependency breaker overrides, keyed by breaker name.
    /// Built-in presets not listed here keep their defaults.
    pub breakers: BTreeMap<String, BreakerOverride>,

    /// Default retry policy for protected dependencies.
    pub retries: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin surface settings.
    pub admin: AdminConfig,
}

impl ServiceConfig {
    /// Built-in presets with the configured overrides applied. Names that are
    /// not presets start from [`CircuitBreakerConfig::default`].
    pub fn breaker_configs(&self) -> BTreeMap<String, CircuitBreakerConfig> {
        let mut configs = presets::builtin();
        for (name, overrides) in &self.breakers {
            let base = configs
                .remove(name)
                .unwrap_or_else(|| CircuitBreakerConfig {
                    name: name.clone(),
                    ..CircuitBreakerConfig::default()
                });
            configs.insert(name.clone(), overrides.apply(base));
        }
        configs
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Grace period for in-flight requests on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting on the API routes.
    pub enabled: bool,

    /// Key clients by the first `X-Forwarded-For` hop instead of the peer address.
    /// Only safe behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,

    /// Limiter tuning.
    pub limiter: RateLimiterConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trust_forwarded_for: false,
            limiter: RateLimiterConfig::default(),
        }
    }
}

/// Partial breaker settings layered over a preset.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_requests: Option<u32>,
}

impl BreakerOverride {
    pub fn apply(&self, base: CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_requests: self.max_requests.unwrap_or(base.max_requests),
            interval_secs: self.interval_secs.unwrap_or(base.interval_secs),
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            min_requests: self.min_requests.unwrap_or(base.min_requests),
            name: base.name,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Growth factor between attempts.
    pub multiplier: f64,

    /// Jitter as a fraction of the computed delay.
    pub jitter_fraction: f64,

    /// What to do when the dependency's breaker rejects an attempt.
    pub on_open_circuit: OpenCircuitBehavior,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
            on_open_circuit: OpenCircuitBehavior::Abort,
        }
    }
}

/// Log output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    pub log_level: String,

    /// Log output style.
    pub log_format: LogFormat,

    /// Enable the `/metrics` endpoint.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            metrics_enabled: true,
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Mount the `/admin` routes.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}
