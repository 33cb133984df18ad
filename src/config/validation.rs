//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ratios in [0, 1], non-zero limits and windows)
//! - Check ordering constraints (decreasing multipliers, recover < escalate)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{RetryConfig, ServiceConfig};
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::security::rate_limit::RateLimiterConfig;

/// One semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a parsed config, collecting every error.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }

    validate_limiter(&config.rate_limit.limiter, &mut errors);

    for (name, breaker) in config.breaker_configs() {
        validate_breaker(&format!("breakers.{name}"), &breaker, &mut errors);
    }

    validate_retries(&config.retries, &mut errors);

    if tracing_subscriber::EnvFilter::try_new(&config.observability.log_level).is_err() {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("'{}' is not a valid filter", config.observability.log_level),
        ));
    }

    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::new("admin.api_key", "must be set when admin is enabled"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_ratio(field: &str, value: f64, errors: &mut Vec<ValidationError>) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(ValidationError::new(field, format!("{value} is outside [0, 1]")));
    }
}

fn check_nonzero(field: &str, value: u64, errors: &mut Vec<ValidationError>) {
    if value == 0 {
        errors.push(ValidationError::new(field, "must be greater than 0"));
    }
}

fn validate_breaker(
    prefix: &str,
    config: &CircuitBreakerConfig,
    errors: &mut Vec<ValidationError>,
) {
    check_ratio(&format!("{prefix}.failure_threshold"), config.failure_threshold, errors);
    check_nonzero(&format!("{prefix}.max_requests"), config.max_requests.into(), errors);
    check_nonzero(&format!("{prefix}.min_requests"), config.min_requests.into(), errors);
    check_nonzero(&format!("{prefix}.timeout_secs"), config.timeout_secs, errors);
}

fn validate_limiter(config: &RateLimiterConfig, errors: &mut Vec<ValidationError>) {
    let prefix = "rate_limit.limiter";
    check_nonzero(&format!("{prefix}.base_limit"), config.base_limit.into(), errors);
    check_nonzero(&format!("{prefix}.window_secs"), config.window_secs, errors);
    check_nonzero(&format!("{prefix}.max_tracked_keys"), config.max_tracked_keys as u64, errors);
    check_nonzero(&format!("{prefix}.idle_eviction_secs"), config.idle_eviction_secs, errors);
    check_nonzero(&format!("{prefix}.eviction_batch"), config.eviction_batch as u64, errors);

    let degradation = &config.degradation;
    let multipliers = &degradation.multipliers;
    if multipliers.is_empty() {
        errors.push(ValidationError::new(
            format!("{prefix}.degradation.multipliers"),
            "needs at least one level",
        ));
    }
    if multipliers.iter().any(|m| !(*m > 0.0 && *m <= 1.0)) {
        errors.push(ValidationError::new(
            format!("{prefix}.degradation.multipliers"),
            "every multiplier must be in (0, 1]",
        ));
    }
    if multipliers.windows(2).any(|pair| pair[1] >= pair[0]) {
        errors.push(ValidationError::new(
            format!("{prefix}.degradation.multipliers"),
            "must be strictly decreasing",
        ));
    }
    check_ratio(
        &format!("{prefix}.degradation.escalate_ratio"),
        degradation.escalate_ratio,
        errors,
    );
    check_ratio(
        &format!("{prefix}.degradation.recover_ratio"),
        degradation.recover_ratio,
        errors,
    );
    if degradation.recover_ratio >= degradation.escalate_ratio {
        errors.push(ValidationError::new(
            format!("{prefix}.degradation.recover_ratio"),
            "must be below escalate_ratio",
        ));
    }
    check_nonzero(
        &format!("{prefix}.degradation.sample_interval_ms"),
        degradation.sample_interval_ms,
        errors,
    );
    // A level may only move once a streak spans more than one sample.
    check_nonzero(
        &format!("{prefix}.degradation.sustain_secs"),
        degradation.sustain_secs,
        errors,
    );
    if degradation.sustain_secs > 0 && degradation.sustain() < degradation.sample_interval() {
        errors.push(ValidationError::new(
            format!("{prefix}.degradation.sustain_secs"),
            "must cover at least one sample_interval_ms",
        ));
    }

    let posture = &config.posture;
    check_ratio(
        &format!("{prefix}.posture.open_key_fraction"),
        posture.open_key_fraction,
        errors,
    );
    check_ratio(
        &format!("{prefix}.posture.open_new_key_ratio"),
        posture.open_new_key_ratio,
        errors,
    );
    check_ratio(
        &format!("{prefix}.posture.half_open_probe_fraction"),
        posture.half_open_probe_fraction,
        errors,
    );
}

fn validate_retries(config: &RetryConfig, errors: &mut Vec<ValidationError>) {
    check_nonzero("retries.max_attempts", config.max_attempts.into(), errors);
    if !(config.multiplier >= 1.0) {
        errors.push(ValidationError::new("retries.multiplier", "must be at least 1.0"));
    }
    check_ratio("retries.jitter_fraction", config.jitter_fraction, errors);
    if config.base_delay_ms > config.max_delay_ms {
        errors.push(ValidationError::new(
            "retries.base_delay_ms",
            "must not exceed max_delay_ms",
        ));
    }
}
