//! Adaptive per-key rate limiting.
//!
//! # Responsibilities
//! - Fixed-window admission per key (client IP by default)
//! - Graduated degradation of the effective limit under sustained denials
//! - Bounded memory: LRU eviction at capacity plus an idle sweep
//! - Self-protective posture against key-space floods
//!
//! # Design Decisions
//! - Key state lives in a sharded [`DashMap`]; no lock spans more than one shard
//! - The tracked-key count is reserved with a CAS before insertion, so the
//!   ceiling holds even under concurrent first-sightings
//! - Degradation level and posture are published through atomics and only
//!   change on samples (`observe`), keeping `check` free of global locks
//! - Config is hot-swappable; key state survives a swap

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics::SharedMetrics;
use crate::resilience::clock::SharedClock;
use crate::security::degradation::{
    effective_limit, DegradationConfig, DegradationController, GlobalLoadSnapshot,
    LimiterPosture, PostureConfig, PostureController,
};

/// Limiter tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Limiter label in logs and metrics.
    pub name: String,

    /// Requests per key per window at degradation level 0.
    pub base_limit: u32,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Hard ceiling on tracked keys.
    pub max_tracked_keys: usize,

    /// Keys unseen for this long are swept.
    pub idle_eviction_secs: u64,

    /// Keys evicted per capacity eviction.
    pub eviction_batch: usize,

    pub degradation: DegradationConfig,

    pub posture: PostureConfig,
}

impl RateLimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn idle_eviction_age(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            name: "api".to_string(),
            base_limit: 60,
            window_secs: 60,
            max_tracked_keys: 10_000,
            idle_eviction_secs: 600,
            eviction_batch: 1,
            degradation: DegradationConfig::default(),
            posture: PostureConfig::default(),
        }
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Zero when allowed.
    pub retry_after: Duration,
    /// Effective limit applied to this check.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Degradation level the decision was made at.
    pub level: usize,
}

/// Per-key window state.
#[derive(Debug, Clone, Copy)]
pub struct KeyState {
    pub window_start: Instant,
    pub count: u32,
    pub last_seen: Instant,
    pub degradation_level: usize,
}

impl KeyState {
    fn new(now: Instant, level: usize) -> Self {
        Self {
            window_start: now,
            count: 0,
            last_seen: now,
            degradation_level: level,
        }
    }

    fn admit(&mut self, now: Instant, window: Duration, limit: u32, level: usize) -> Decision {
        if now >= self.window_start + window {
            self.window_start = now;
            self.count = 0;
        }
        self.last_seen = now;
        self.degradation_level = level;

        if self.count < limit {
            self.count += 1;
            Decision {
                allowed: true,
                retry_after: Duration::ZERO,
                limit,
                remaining: limit - self.count,
                level,
            }
        } else {
            Decision {
                allowed: false,
                retry_after: (self.window_start + window).saturating_duration_since(now),
                limit,
                remaining: 0,
                level,
            }
        }
    }
}

/// Serializable limiter status.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub name: String,
    pub tracked_keys: usize,
    pub max_tracked_keys: usize,
    pub degradation_level: usize,
    pub effective_limit: u32,
    pub posture: LimiterPosture,
    pub total_allowed: u64,
    pub total_denied: u64,
    pub total_evicted: u64,
}

#[derive(Debug, Default)]
struct Controllers {
    degradation: DegradationController,
    posture: PostureController,
}

/// Per-key admission controller.
pub struct RateLimiter {
    config: ArcSwap<RateLimiterConfig>,
    keys: DashMap<String, KeyState>,
    tracked: AtomicUsize,

    // Since the last sample.
    sample_allowed: AtomicU64,
    sample_denied: AtomicU64,
    sample_new_keys: AtomicU64,

    total_allowed: AtomicU64,
    total_denied: AtomicU64,
    total_evicted: AtomicU64,

    level: AtomicUsize,
    posture: AtomicU8,
    controllers: Mutex<Controllers>,
    last_sweep: Mutex<Instant>,

    clock: SharedClock,
    metrics: SharedMetrics,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, clock: SharedClock, metrics: SharedMetrics) -> Self {
        let now = clock.now();
        metrics.set_tracked_keys(&config.name, 0);
        metrics.set_degradation_level(&config.name, 0);
        metrics.record_state(&config.name, LimiterPosture::Closed.as_str());

        Self {
            config: ArcSwap::from_pointee(config),
            keys: DashMap::new(),
            tracked: AtomicUsize::new(0),
            sample_allowed: AtomicU64::new(0),
            sample_denied: AtomicU64::new(0),
            sample_new_keys: AtomicU64::new(0),
            total_allowed: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
            level: AtomicUsize::new(0),
            posture: AtomicU8::new(LimiterPosture::Closed.as_u8()),
            controllers: Mutex::new(Controllers::default()),
            last_sweep: Mutex::new(now),
            clock,
            metrics,
        }
    }

    /// Current config.
    pub fn config(&self) -> Arc<RateLimiterConfig> {
        self.config.load_full()
    }

    /// Swap the config atomically. Tracked keys and their windows are kept;
    /// a lowered `max_tracked_keys` is enforced on the next insertions.
    pub fn update_config(&self, config: RateLimiterConfig) {
        tracing::info!(
            limiter = %config.name,
            base_limit = config.base_limit,
            window_secs = config.window_secs,
            max_tracked_keys = config.max_tracked_keys,
            "Rate limiter config updated"
        );
        self.config.store(Arc::new(config));
    }

    pub fn tracked_keys(&self) -> usize {
        self.tracked.load(Ordering::Acquire)
    }

    pub fn level(&self) -> usize {
        self.level.load(Ordering::Acquire)
    }

    pub fn posture(&self) -> LimiterPosture {
        LimiterPosture::from_u8(self.posture.load(Ordering::Acquire))
    }

    /// State of one key, if tracked.
    pub fn key_state(&self, key: &str) -> Option<KeyState> {
        self.keys.get(key).map(|entry| *entry.value())
    }

    /// Admission check without a path label.
    pub fn check(&self, key: &str) -> Decision {
        self.check_with_path(key, "-")
    }

    /// Admission check; `path` only labels the admission metric.
    pub fn check_with_path(&self, key: &str, path: &str) -> Decision {
        let started = Instant::now();
        let now = self.clock.now();
        let config = self.config.load();

        self.maybe_sweep(now, &config);

        let level = self.level().min(config.degradation.max_level());
        let limit = effective_limit(config.base_limit, &config.degradation, level);
        let window = config.window();

        let existing = self
            .keys
            .get_mut(key)
            .map(|mut state| state.admit(now, window, limit, level));

        let decision = match existing {
            Some(decision) => decision,
            None => self.admit_new_key(key, now, &config, limit, level),
        };

        if decision.allowed {
            self.sample_allowed.fetch_add(1, Ordering::Relaxed);
            self.total_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sample_denied.fetch_add(1, Ordering::Relaxed);
            self.total_denied.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics
            .record_admission(&config.name, path, decision.allowed);
        self.metrics
            .observe_check_latency(&config.name, started.elapsed().as_secs_f64());
        decision
    }

    fn admit_new_key(
        &self,
        key: &str,
        now: Instant,
        config: &RateLimiterConfig,
        limit: u32,
        level: usize,
    ) -> Decision {
        let denied = |retry_after: Duration| Decision {
            allowed: false,
            retry_after,
            limit,
            remaining: 0,
            level,
        };

        // Posture denials still count as churn.
        self.sample_new_keys.fetch_add(1, Ordering::Relaxed);

        match self.posture() {
            LimiterPosture::Open => return denied(config.posture.cooldown()),
            LimiterPosture::HalfOpen
                if fastrand::f64() >= config.posture.half_open_probe_fraction =>
            {
                return denied(config.posture.cooldown());
            }
            _ => {}
        }

        if !self.reserve_slot(config) {
            tracing::warn!(limiter = %config.name, "Key tracking disabled, denying new key");
            return denied(config.window());
        }

        let decision = match self.keys.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                // Another check inserted the key first; give the slot back.
                self.tracked.fetch_sub(1, Ordering::AcqRel);
                occupied.get_mut().admit(now, config.window(), limit, level)
            }
            Entry::Vacant(vacant) => {
                let mut state = KeyState::new(now, level);
                let decision = state.admit(now, config.window(), limit, level);
                vacant.insert(state);
                decision
            }
        };
        self.metrics.set_tracked_keys(&config.name, self.tracked_keys());
        decision
    }

    /// Reserve room for one more key, evicting least-recently-seen keys at capacity.
    ///
    /// Fails only when `max_tracked_keys` is zero. When a concurrent check
    /// evicted the scanned victim first, the scan is repeated.
    fn reserve_slot(&self, config: &RateLimiterConfig) -> bool {
        let max = config.max_tracked_keys;
        if max == 0 {
            return false;
        }
        loop {
            let current = self.tracked.load(Ordering::Acquire);
            if current < max {
                if self
                    .tracked
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            let batch = config.eviction_batch.max(1).max(current + 1 - max);
            if self.evict_lru(batch, config) == 0 && self.keys.is_empty() {
                // Every slot is reserved by a check that has not inserted yet.
                std::thread::yield_now();
            }
        }
    }

    /// Remove up to `batch` least-recently-seen keys. Returns how many were removed.
    fn evict_lru(&self, batch: usize, config: &RateLimiterConfig) -> usize {
        let mut oldest: Vec<(String, Instant)> = Vec::with_capacity(batch + 1);
        for entry in self.keys.iter() {
            let seen = entry.value().last_seen;
            if oldest.len() < batch {
                oldest.push((entry.key().clone(), seen));
                oldest.sort_by_key(|(_, s)| *s);
            } else if oldest.last().is_some_and(|(_, newest)| seen < *newest) {
                oldest.pop();
                oldest.push((entry.key().clone(), seen));
                oldest.sort_by_key(|(_, s)| *s);
            }
        }

        let mut removed = 0;
        for (key, seen) in oldest {
            // Skip keys refreshed since the scan.
            if self
                .keys
                .remove_if(&key, |_, state| state.last_seen == seen)
                .is_some()
            {
                self.tracked.fetch_sub(1, Ordering::AcqRel);
                removed += 1;
            }
        }

        if removed > 0 {
            self.total_evicted.fetch_add(removed as u64, Ordering::Relaxed);
            self.metrics.record_evictions(&config.name, removed as u64);
            self.metrics.set_tracked_keys(&config.name, self.tracked_keys());
            tracing::debug!(
                limiter = %config.name,
                evicted = removed,
                "Evicted least recently seen keys"
            );
        }
        removed
    }

    /// Sweep idle keys now. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let config = self.config.load();
        self.sweep(now, &config)
    }

    fn maybe_sweep(&self, now: Instant, config: &RateLimiterConfig) {
        let due = match self.last_sweep.try_lock() {
            Ok(mut last) => {
                if now.saturating_duration_since(*last) >= config.idle_eviction_age() {
                    *last = now;
                    true
                } else {
                    false
                }
            }
            // Someone else is checking or sweeping.
            Err(_) => false,
        };
        if due {
            self.sweep(now, config);
        }
    }

    fn sweep(&self, now: Instant, config: &RateLimiterConfig) -> usize {
        let idle_age = config.idle_eviction_age();
        let mut removed = 0usize;
        self.keys.retain(|_, state| {
            let keep = now.saturating_duration_since(state.last_seen) < idle_age;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            self.tracked.fetch_sub(removed, Ordering::AcqRel);
            self.total_evicted.fetch_add(removed as u64, Ordering::Relaxed);
            self.metrics.record_evictions(&config.name, removed as u64);
            self.metrics.set_tracked_keys(&config.name, self.tracked_keys());
            tracing::debug!(limiter = %config.name, evicted = removed, "Swept idle keys");
        }
        removed
    }

    /// Take one load sample: sweep idle keys, then advance the degradation
    /// and posture controllers.
    pub fn observe(&self) -> GlobalLoadSnapshot {
        let now = self.clock.now();
        let config = self.config.load();

        self.sweep(now, &config);
        if let Ok(mut last) = self.last_sweep.lock() {
            *last = now;
        }

        let snapshot = GlobalLoadSnapshot::new(
            self.tracked_keys(),
            self.sample_allowed.swap(0, Ordering::AcqRel),
            self.sample_denied.swap(0, Ordering::AcqRel),
            self.sample_new_keys.swap(0, Ordering::AcqRel),
        );

        let mut controllers = self
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(change) =
            controllers
                .degradation
                .observe(now, snapshot.denial_ratio, &config.degradation)
        {
            self.level.store(change.to, Ordering::Release);
            let limit = effective_limit(config.base_limit, &config.degradation, change.to);
            tracing::warn!(
                limiter = %config.name,
                from = change.from,
                to = change.to,
                denial_ratio = snapshot.denial_ratio,
                effective_limit = limit,
                "Degradation level changed"
            );
        }

        let posture_change = if config.posture.enabled {
            controllers
                .posture
                .observe(now, &snapshot, config.max_tracked_keys, &config.posture)
        } else {
            controllers.posture.reset()
        };
        if let Some((from, to)) = posture_change {
            self.posture.store(to.as_u8(), Ordering::Release);
            self.metrics.record_state(&config.name, to.as_str());
            tracing::warn!(
                limiter = %config.name,
                from = %from,
                to = %to,
                active_keys = snapshot.active_keys,
                new_key_ratio = snapshot.new_key_ratio,
                "Limiter posture changed"
            );
        }
        drop(controllers);

        self.metrics.set_tracked_keys(&config.name, snapshot.active_keys);
        self.metrics.set_degradation_level(&config.name, self.level());
        snapshot
    }

    /// Sample on the configured interval until `shutdown` fires.
    pub fn spawn_observer(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let period = limiter.config().degradation.sample_interval();
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.observe();
                    }
                }
            }
            tracing::debug!(limiter = %limiter.config().name, "Rate limiter observer stopped");
        })
    }

    pub fn status(&self) -> LimiterStatus {
        let config = self.config.load();
        let level = self.level();
        LimiterStatus {
            name: config.name.clone(),
            tracked_keys: self.tracked_keys(),
            max_tracked_keys: config.max_tracked_keys,
            degradation_level: level,
            effective_limit: effective_limit(config.base_limit, &config.degradation, level),
            posture: self.posture(),
            total_allowed: self.total_allowed.load(Ordering::Relaxed),
            total_denied: self.total_denied.load(Ordering::Relaxed),
            total_evicted: self.total_evicted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.config.load().name)
            .field("tracked_keys", &self.tracked_keys())
            .field("level", &self.level())
            .field("posture", &self.posture())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::{NoopMetrics, PrometheusMetrics};
    use crate::resilience::clock::ManualClock;

    fn config(base_limit: u32, max_tracked_keys: usize) -> RateLimiterConfig {
        RateLimiterConfig {
            name: "test".into(),
            base_limit,
            window_secs: 60,
            max_tracked_keys,
            idle_eviction_secs: 600,
            eviction_batch: 1,
            degradation: DegradationConfig {
                sustain_secs: 10,
                ..DegradationConfig::default()
            },
            posture: PostureConfig {
                enabled: false,
                ..PostureConfig::default()
            },
        }
    }

    fn limiter(config: RateLimiterConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(config, clock.clone(), NoopMetrics::shared());
        (limiter, clock)
    }

    #[test]
    fn test_limit_then_deny() {
        let (limiter, clock) = limiter(config(3, 100));

        for expected_remaining in [2, 1, 0] {
            let d = limiter.check("10.0.0.1");
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
            assert_eq!(d.limit, 3);
        }

        clock.advance(Duration::from_secs(20));
        let denied = limiter.check("10.0.0.1");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(40));

        // Other keys are independent.
        assert!(limiter.check("10.0.0.2").allowed);
    }

    #[test]
    fn test_window_reset() {
        let (limiter, clock) = limiter(config(2, 100));
        limiter.check("k");
        limiter.check("k");
        assert!(!limiter.check("k").allowed);

        clock.advance(Duration::from_secs(60));
        assert!(limiter.check("k").allowed);
        assert!(limiter.check("k").allowed);
        assert!(!limiter.check("k").allowed);
    }

    #[test]
    fn test_capacity_evicts_least_recently_seen() {
        let clock = Arc::new(ManualClock::new());
        let metrics = PrometheusMetrics::shared();
        let limiter = RateLimiter::new(config(10, 3), clock.clone(), metrics.clone());

        for key in ["a", "b", "c"] {
            limiter.check(key);
            clock.advance(Duration::from_secs(1));
        }
        // Refresh "a" so "b" becomes the oldest.
        limiter.check("a");
        clock.advance(Duration::from_secs(1));

        limiter.check("d");
        assert_eq!(limiter.tracked_keys(), 3);
        assert!(limiter.key_state("b").is_none());
        assert!(limiter.key_state("a").is_some());
        assert!(limiter.key_state("d").is_some());
        assert_eq!(limiter.status().total_evicted, 1);
        assert!(metrics
            .render()
            .lines()
            .any(|l| l.starts_with("ratelimit_evictions_total{") && l.ends_with(" 1")));
    }

    #[test]
    fn test_idle_sweep() {
        let (limiter, clock) = limiter(config(10, 100));
        limiter.check("old");
        clock.advance(Duration::from_secs(500));
        limiter.check("fresh");
        clock.advance(Duration::from_secs(200));

        assert_eq!(limiter.evict_idle(), 1);
        assert!(limiter.key_state("old").is_none());
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_sustained_denials_degrade_limit() {
        let (limiter, clock) = limiter(config(4, 100));
        let exhaust = |limiter: &RateLimiter| {
            for _ in 0..8 {
                limiter.check("hot");
            }
        };

        exhaust(&limiter);
        limiter.observe();
        assert_eq!(limiter.level(), 0);

        clock.advance(Duration::from_secs(10));
        exhaust(&limiter);
        let snapshot = limiter.observe();
        assert!(snapshot.denial_ratio > 0.3);
        assert_eq!(limiter.level(), 1);

        clock.advance(Duration::from_secs(60));
        let d = limiter.check("hot");
        assert_eq!(d.level, 1);
        assert_eq!(d.limit, 2);
    }

    #[test]
    fn test_open_posture_denies_only_new_keys() {
        let mut cfg = config(10, 10);
        cfg.posture = PostureConfig {
            enabled: true,
            open_key_fraction: 0.5,
            min_samples: 5,
            cooldown_secs: 30,
            ..PostureConfig::default()
        };
        let (limiter, clock) = limiter(cfg);

        for i in 0..5 {
            limiter.check(&format!("k{i}"));
        }
        limiter.observe();
        assert_eq!(limiter.posture(), LimiterPosture::Open);

        let denied = limiter.check("newcomer");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(30));
        assert!(limiter.key_state("newcomer").is_none());
        assert!(limiter.check("k0").allowed);

        clock.advance(Duration::from_secs(30));
        limiter.observe();
        assert_eq!(limiter.posture(), LimiterPosture::HalfOpen);
    }

    #[test]
    fn test_update_config_keeps_state() {
        let (limiter, _clock) = limiter(config(2, 100));
        limiter.check("k");
        limiter.check("k");
        assert!(!limiter.check("k").allowed);

        limiter.update_config(config(5, 100));
        let d = limiter.check("k");
        assert!(d.allowed);
        assert_eq!(d.limit, 5);
        assert_eq!(d.remaining, 2);
    }
}
