//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Delay before retry number `attempt` (1-based), without jitter:
/// `min(base × multiplier^(attempt-1), max)`.
pub fn base_delay(attempt: u32, base: Duration, max: Duration, multiplier: f64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * multiplier.max(1.0).powi(exponent);
    match Duration::try_from_secs_f64(secs) {
        Ok(delay) => delay.min(max),
        // Overflowed or non-finite: the cap wins.
        Err(_) => max,
    }
}

/// Calculate exponential backoff delay with jitter in `[0, delay × jitter_fraction)`.
pub fn calculate_backoff(
    attempt: u32,
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter_fraction: f64,
) -> Duration {
    let delay = base_delay(attempt, base, max, multiplier);

    let jitter_range = delay.as_secs_f64() * jitter_fraction.clamp(0.0, 1.0);
    let jitter = if jitter_range > 0.0 {
        rand::thread_rng().gen_range(0.0..jitter_range)
    } else {
        0.0
    };

    delay + Duration::from_secs_f64(jitter)
}
