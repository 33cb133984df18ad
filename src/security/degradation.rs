//! Load-driven controllers for the rate limiter.
//!
//! # Responsibilities
//! - Degrade the effective per-key limit in steps while denials stay high
//! - Trip a self-protective posture when the key space itself is under attack:
//!   most checks come from keys never seen before while the key space is
//!   already near capacity
//!
//! # State Transitions
//! ```text
//! Degradation:  level+1 after denial_ratio > escalate_ratio for `sustain`
//!               level-1 after denial_ratio < recover_ratio  for `sustain`
//!
//! Posture:      Closed   → Open      open condition holds on a sample
//!               Open     → HalfOpen  cooldown elapsed
//!               HalfOpen → Closed    open condition cleared on the next sample
//!               HalfOpen → Open      open condition still holds
//! ```
//!
//! Both controllers are owned values advanced by samples; time is passed in.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Degradation bands and hysteresis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Limit multiplier per level, strictly decreasing; index 0 is normal operation.
    pub multipliers: Vec<f64>,

    /// Denial ratio above which a level escalation is considered.
    pub escalate_ratio: f64,

    /// Denial ratio below which a level recovery is considered.
    pub recover_ratio: f64,

    /// How long a ratio must stay past a threshold before the level moves.
    pub sustain_secs: u64,

    /// Background sampling period.
    pub sample_interval_ms: u64,
}

impl DegradationConfig {
    pub fn sustain(&self) -> Duration {
        Duration::from_secs(self.sustain_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Highest reachable level.
    pub fn max_level(&self) -> usize {
        self.multipliers.len().saturating_sub(1)
    }

    /// Multiplier for `level`, clamped to the last band.
    pub fn multiplier(&self, level: usize) -> f64 {
        self.multipliers
            .get(level.min(self.max_level()))
            .copied()
            .unwrap_or(1.0)
    }
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            multipliers: vec![1.0, 0.5, 0.25, 0.1],
            escalate_ratio: 0.3,
            recover_ratio: 0.05,
            sustain_secs: 30,
            sample_interval_ms: 1000,
        }
    }
}

/// `max(1, floor(base × multiplier[level]))`.
pub fn effective_limit(base_limit: u32, config: &DegradationConfig, level: usize) -> u32 {
    let scaled = (base_limit as f64 * config.multiplier(level)).floor();
    if scaled.is_finite() && scaled >= 1.0 {
        // Multipliers never exceed 1.0 after validation, so this fits in u32.
        (scaled as u64).min(u32::MAX as u64) as u32
    } else {
        1
    }
}

/// Posture thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostureConfig {
    pub enabled: bool,

    /// Tracked keys must reach this share of `max_tracked_keys` to open.
    pub open_key_fraction: f64,

    /// Share of a sample's checks that must come from untracked keys to open.
    pub open_new_key_ratio: f64,

    /// Checks a sample needs before the new-key ratio is trusted.
    pub min_samples: u64,

    /// Time spent Open before probing.
    pub cooldown_secs: u64,

    /// Share of new keys admitted while Half-Open.
    pub half_open_probe_fraction: f64,
}

impl PostureConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for PostureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            open_key_fraction: 0.9,
            open_new_key_ratio: 0.5,
            min_samples: 100,
            cooldown_secs: 30,
            half_open_probe_fraction: 0.1,
        }
    }
}

/// Self-protective posture of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterPosture {
    /// Normal operation.
    Closed,
    /// Keys not already tracked are denied.
    Open,
    /// A sampled share of new keys is admitted.
    HalfOpen,
}

impl LimiterPosture {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterPosture::Closed => "closed",
            LimiterPosture::Open => "open",
            LimiterPosture::HalfOpen => "half_open",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            LimiterPosture::Closed => 0,
            LimiterPosture::Open => 1,
            LimiterPosture::HalfOpen => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LimiterPosture::Open,
            2 => LimiterPosture::HalfOpen,
            _ => LimiterPosture::Closed,
        }
    }
}

impl fmt::Display for LimiterPosture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load observed over one sample period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GlobalLoadSnapshot {
    pub active_keys: usize,
    pub allowed: u64,
    pub denied: u64,
    pub new_keys: u64,
    pub denial_ratio: f64,
    pub new_key_ratio: f64,
}

impl GlobalLoadSnapshot {
    pub fn new(active_keys: usize, allowed: u64, denied: u64, new_keys: u64) -> Self {
        let checks = allowed.saturating_add(denied);
        let ratio = |n: u64| if checks == 0 { 0.0 } else { n as f64 / checks as f64 };
        Self {
            active_keys,
            allowed,
            denied,
            new_keys,
            denial_ratio: ratio(denied),
            new_key_ratio: ratio(new_keys),
        }
    }

    pub fn checks(&self) -> u64 {
        self.allowed.saturating_add(self.denied)
    }
}

/// A level change produced by [`DegradationController::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChange {
    pub from: usize,
    pub to: usize,
}

/// Hysteresis over the denial ratio.
#[derive(Debug, Default)]
pub struct DegradationController {
    level: usize,
    above_since: Option<Instant>,
    below_since: Option<Instant>,
}

impl DegradationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Feed one sample's denial ratio.
    pub fn observe(
        &mut self,
        now: Instant,
        denial_ratio: f64,
        config: &DegradationConfig,
    ) -> Option<LevelChange> {
        let max_level = config.max_level();
        if self.level > max_level {
            // Bands shrank under a config reload.
            let from = self.level;
            self.level = max_level;
            self.reset_streaks();
            return Some(LevelChange { from, to: max_level });
        }

        // A streak opened by this sample never moves the level.
        let sustain = config.sustain();
        if denial_ratio > config.escalate_ratio {
            self.below_since = None;
            let Some(since) = self.above_since else {
                self.above_since = Some(now);
                return None;
            };
            if self.level < max_level && now.saturating_duration_since(since) >= sustain {
                return Some(self.step(self.level + 1));
            }
        } else if denial_ratio < config.recover_ratio {
            self.above_since = None;
            let Some(since) = self.below_since else {
                self.below_since = Some(now);
                return None;
            };
            if self.level > 0 && now.saturating_duration_since(since) >= sustain {
                return Some(self.step(self.level - 1));
            }
        } else {
            self.reset_streaks();
        }
        None
    }

    fn step(&mut self, to: usize) -> LevelChange {
        let from = self.level;
        self.level = to;
        self.reset_streaks();
        LevelChange { from, to }
    }

    fn reset_streaks(&mut self) {
        self.above_since = None;
        self.below_since = None;
    }
}

/// Tracks the self-protective posture.
#[derive(Debug)]
pub struct PostureController {
    posture: LimiterPosture,
    opened_at: Option<Instant>,
}

impl PostureController {
    pub fn new() -> Self {
        Self {
            posture: LimiterPosture::Closed,
            opened_at: None,
        }
    }

    pub fn posture(&self) -> LimiterPosture {
        self.posture
    }

    /// Time left before an Open posture starts probing.
    pub fn remaining_open(&self, now: Instant, config: &PostureConfig) -> Option<Duration> {
        match (self.posture, self.opened_at) {
            (LimiterPosture::Open, Some(at)) => {
                Some((at + config.cooldown()).saturating_duration_since(now))
            }
            _ => None,
        }
    }

    /// Whether a sample describes an attack on the key space.
    ///
    /// Needs both churn and occupancy. A full key space alone is normal
    /// traffic that LRU eviction already bounds.
    pub fn should_open(
        snapshot: &GlobalLoadSnapshot,
        max_tracked_keys: usize,
        config: &PostureConfig,
    ) -> bool {
        let churn = snapshot.checks() >= config.min_samples
            && snapshot.new_key_ratio >= config.open_new_key_ratio;
        let key_pressure =
            snapshot.active_keys as f64 >= config.open_key_fraction * max_tracked_keys as f64;
        churn && key_pressure
    }

    /// Feed one sample. Returns `(from, to)` on a change.
    pub fn observe(
        &mut self,
        now: Instant,
        snapshot: &GlobalLoadSnapshot,
        max_tracked_keys: usize,
        config: &PostureConfig,
    ) -> Option<(LimiterPosture, LimiterPosture)> {
        let open = Self::should_open(snapshot, max_tracked_keys, config);
        let next = match self.posture {
            LimiterPosture::Closed if open => LimiterPosture::Open,
            LimiterPosture::Closed => LimiterPosture::Closed,
            LimiterPosture::Open => match self.opened_at {
                Some(at) if now.saturating_duration_since(at) >= config.cooldown() => {
                    LimiterPosture::HalfOpen
                }
                Some(_) => LimiterPosture::Open,
                None => LimiterPosture::HalfOpen,
            },
            LimiterPosture::HalfOpen if open => LimiterPosture::Open,
            LimiterPosture::HalfOpen => LimiterPosture::Closed,
        };

        if next == self.posture {
            return None;
        }
        let from = self.posture;
        self.posture = next;
        self.opened_at = (next == LimiterPosture::Open).then_some(now);
        Some((from, next))
    }

    /// Force the posture back to Closed (used when the posture is disabled).
    pub fn reset(&mut self) -> Option<(LimiterPosture, LimiterPosture)> {
        let from = self.posture;
        self.posture = LimiterPosture::Closed;
        self.opened_at = None;
        (from != LimiterPosture::Closed).then_some((from, LimiterPosture::Closed))
    }
}

impl Default for PostureController {
    fn default() -> Self {
        Self::new()
    }
}
