//! Built-in breaker presets per protected dependency.
//!
//! Presets are data, not code: every value here can be overridden under
//! `[breakers.<name>]` in the config file without touching the state machine.
//!
//! | preset         | trips at            | cooldown |
//! |----------------|---------------------|----------|
//! | `database`     | 100% over 5 calls   | 30s      |
//! | `ai_provider`  | 60% over 5 calls    | 60s      |
//! | `feed_fetcher` | 70% over 10 calls   | 120s     |
//! | `web_scraper`  | 80% over 5 calls    | 1h       |

use std::collections::BTreeMap;

use crate::resilience::circuit_breaker::CircuitBreakerConfig;

pub const DATABASE: &str = "database";
pub const AI_PROVIDER: &str = "ai_provider";
pub const FEED_FETCHER: &str = "feed_fetcher";
pub const WEB_SCRAPER: &str = "web_scraper";

/// Fast, cheap dependency expected to recover quickly.
pub fn database() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        name: DATABASE.to_string(),
        max_requests: 1,
        interval_secs: 60,
        timeout_secs: 30,
        failure_threshold: 1.0,
        min_requests: 5,
    }
}

/// Paid external summarization provider; tolerates occasional hiccups.
pub fn ai_provider() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        name: AI_PROVIDER.to_string(),
        max_requests: 1,
        interval_secs: 60,
        timeout_secs: 60,
        failure_threshold: 0.6,
        min_requests: 5,
    }
}

/// Remote feed fetcher; network flakiness is common and benign.
pub fn feed_fetcher() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        name: FEED_FETCHER.to_string(),
        max_requests: 3,
        interval_secs: 60,
        timeout_secs: 120,
        failure_threshold: 0.7,
        min_requests: 10,
    }
}

/// Web scraper; long cooldown avoids hammering a blocking or restructured site.
pub fn web_scraper() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        name: WEB_SCRAPER.to_string(),
        max_requests: 1,
        interval_secs: 300,
        timeout_secs: 3600,
        failure_threshold: 0.8,
        min_requests: 5,
    }
}

/// All built-in presets keyed by name.
pub fn builtin() -> BTreeMap<String, CircuitBreakerConfig> {
    [database(), ai_provider(), feed_fetcher(), web_scraper()]
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect()
}
