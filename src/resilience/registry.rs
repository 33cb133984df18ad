//! Startup-built registry of named breakers.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RetryConfig;
use crate::observability::metrics::SharedMetrics;
use crate::resilience::circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig};
use crate::resilience::clock::SharedClock;
use crate::resilience::dependency::ProtectedDependency;
use crate::resilience::presets;
use crate::resilience::retries::RetryPolicy;

/// Breakers keyed by dependency name, built once and shared for the process.
#[derive(Debug)]
pub struct DependencyRegistry {
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
    retries: RetryConfig,
    metrics: SharedMetrics,
}

impl DependencyRegistry {
    /// Build one breaker per entry. The map key is the breaker name.
    pub fn new(
        configs: &BTreeMap<String, CircuitBreakerConfig>,
        retries: RetryConfig,
        clock: SharedClock,
        metrics: SharedMetrics,
    ) -> Self {
        let breakers = configs
            .iter()
            .map(|(name, config)| {
                let config = CircuitBreakerConfig {
                    name: name.clone(),
                    ..config.clone()
                };
                let breaker = CircuitBreaker::new(config, clock.clone(), metrics.clone());
                (name.clone(), Arc::new(breaker))
            })
            .collect::<BTreeMap<_, _>>();

        tracing::info!(
            breakers = ?breakers.keys().collect::<Vec<_>>(),
            "Dependency breakers initialized"
        );

        Self {
            breakers,
            retries,
            metrics,
        }
    }

    /// Registry over the built-in presets only.
    pub fn from_presets(clock: SharedClock, metrics: SharedMetrics) -> Self {
        Self::new(&presets::builtin(), RetryConfig::default(), clock, metrics)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.breakers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Status of every breaker, ordered by name.
    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        self.breakers.values().map(|b| b.status()).collect()
    }

    /// Pair the named breaker with an explicit retry policy.
    pub fn protect_with<E: 'static>(
        &self,
        name: &str,
        policy: RetryPolicy<E>,
    ) -> Option<ProtectedDependency<E>> {
        self.get(name)
            .map(|breaker| ProtectedDependency::new(breaker, policy))
    }

    /// Pair the named breaker with the configured default retry policy.
    pub fn protect<E: 'static>(&self, name: &str) -> Option<ProtectedDependency<E>> {
        let policy = RetryPolicy::from_config(&self.retries).with_metrics(self.metrics.clone());
        self.protect_with(name, policy)
    }
}
