//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through and are counted
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a bounded batch of probe calls tests recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open:       requests >= min_requests && failures/requests >= failure_threshold
//! Open → Half-Open:    timeout elapsed since entering Open
//! Half-Open → Closed:  a probe succeeds
//! Half-Open → Open:    a probe fails
//! ```
//!
//! # Design Decisions
//! - One breaker per protected dependency (not global)
//! - The state machine is an owned type ([`BreakerCore`]) with a single entry
//!   point pair (`before_call` / `after_call`) so every transition is testable
//!   without running real calls
//! - Counts reset on every interval while Closed and on every transition
//! - Results from calls admitted before a transition are ignored (generations)
//! - A call that is dropped or cancelled mid-flight releases its probe slot
//!   and is counted neither as a success nor as a failure
//!
//! # Known gap
//! A single-row query API that defers its error until the row is scanned
//! returns success to the breaker; that failure mode is not counted.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics::SharedMetrics;
use crate::resilience::clock::SharedClock;

/// Circuit breaker state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning for a single breaker. Presets live in [`crate::resilience::presets`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Breaker name used in logs and metrics.
    pub name: String,

    /// Probe calls admitted while Half-Open.
    pub max_requests: u32,

    /// Closed-state counter reset period in seconds (0 disables the reset).
    pub interval_secs: u64,

    /// Open-state cooldown in seconds.
    pub timeout_secs: u64,

    /// Failure ratio in [0, 1] at which the breaker trips.
    pub failure_threshold: f64,

    /// Minimum sample size before the ratio is evaluated.
    pub min_requests: u32,
}

impl CircuitBreakerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_requests: 1,
            interval_secs: 60,
            timeout_secs: 60,
            failure_threshold: 0.5,
            min_requests: 5,
        }
    }
}

/// Request counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn on_abandon(&mut self) {
        self.requests = self.requests.saturating_sub(1);
    }

    /// Failures over requests, 0 when nothing was counted.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.requests as f64
        }
    }
}

/// Why a call was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{breaker}' is {state}")]
pub struct Rejection {
    /// Name of the rejecting breaker.
    pub breaker: String,
    /// State at the time of rejection (Open, or Half-Open with the probe budget spent).
    pub state: CircuitState,
    /// Time until the breaker will admit probes again, when known.
    pub retry_after: Option<Duration>,
}

/// Result of a guarded call.
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// The call ran and succeeded.
    Success(T),
    /// The call was not run.
    Rejected(Rejection),
    /// The call ran and failed.
    Failed(E),
    /// The caller cancelled before the call completed.
    Cancelled,
}

impl<T, E> Outcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }

    /// The success value, if any.
    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(v) => Some(v),
            _ => None,
        }
    }
}

/// Admission ticket handed out by [`BreakerCore::before_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
    state: CircuitState,
}

/// How an admitted call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    Success,
    Failure,
    /// Dropped or cancelled before completion.
    Abandoned,
}

/// A state change produced by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// The owned breaker state machine. Time is always passed in.
#[derive(Debug)]
pub struct BreakerCore {
    config: CircuitBreakerConfig,
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// Closed: next counter reset. Open: end of cooldown. Half-Open: unused.
    expiry: Option<Instant>,
    probes_in_flight: u32,
    opened_at: Option<Instant>,
}

impl BreakerCore {
    pub fn new(config: CircuitBreakerConfig, now: Instant) -> Self {
        let mut core = Self {
            config,
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
            probes_in_flight: 0,
            opened_at: None,
        };
        core.new_generation(now);
        core
    }

    /// State as last computed. Never mutates.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn counts(&self) -> Counts {
        self.counts
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Time left in the Open cooldown, as of `now`.
    pub fn remaining_open(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.expiry) {
            (CircuitState::Open, Some(expiry)) => Some(expiry.saturating_duration_since(now)),
            _ => None,
        }
    }

    /// Try to admit a call.
    pub fn before_call(
        &mut self,
        now: Instant,
    ) -> (Result<Ticket, Rejection>, Option<Transition>) {
        let transition = self.refresh(now);

        match self.state {
            CircuitState::Open => {
                return (Err(self.rejection(now)), transition);
            }
            CircuitState::HalfOpen if self.probes_in_flight >= self.config.max_requests => {
                return (Err(self.rejection(now)), transition);
            }
            CircuitState::HalfOpen => {
                self.probes_in_flight += 1;
            }
            CircuitState::Closed => {}
        }

        self.counts.on_request();
        let ticket = Ticket {
            generation: self.generation,
            state: self.state,
        };
        (Ok(ticket), transition)
    }

    /// Record how an admitted call ended.
    pub fn after_call(
        &mut self,
        now: Instant,
        ticket: Ticket,
        result: CallResult,
    ) -> Option<Transition> {
        let refreshed = self.refresh(now);
        if ticket.generation != self.generation {
            return refreshed;
        }

        let changed = match (self.state, result) {
            (_, CallResult::Abandoned) => {
                self.counts.on_abandon();
                if ticket.state == CircuitState::HalfOpen {
                    self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                }
                None
            }
            (CircuitState::Closed, CallResult::Success) => {
                self.counts.on_success();
                None
            }
            (CircuitState::Closed, CallResult::Failure) => {
                self.counts.on_failure();
                if self.should_trip() {
                    self.set_state(CircuitState::Open, now)
                } else {
                    None
                }
            }
            (CircuitState::HalfOpen, CallResult::Success) => {
                self.counts.on_success();
                self.set_state(CircuitState::Closed, now)
            }
            (CircuitState::HalfOpen, CallResult::Failure) => {
                self.counts.on_failure();
                self.set_state(CircuitState::Open, now)
            }
            // An Open breaker shares no generation with an admitted ticket.
            (CircuitState::Open, _) => None,
        };

        changed.or(refreshed)
    }

    fn should_trip(&self) -> bool {
        self.counts.requests >= self.config.min_requests
            && self.counts.failure_ratio() >= self.config.failure_threshold
    }

    /// Apply time-driven changes: the closed-state interval reset and the
    /// Open → Half-Open cooldown expiry.
    fn refresh(&mut self, now: Instant) -> Option<Transition> {
        match (self.state, self.expiry) {
            (CircuitState::Closed, Some(expiry)) if now >= expiry => {
                self.new_generation(now);
                None
            }
            (CircuitState::Open, Some(expiry)) if now >= expiry => {
                self.set_state(CircuitState::HalfOpen, now)
            }
            _ => None,
        }
    }

    fn set_state(&mut self, to: CircuitState, now: Instant) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.opened_at = if to == CircuitState::Open { Some(now) } else { None };
        self.new_generation(now);
        Some(Transition { from, to })
    }

    fn new_generation(&mut self, now: Instant) {
        self.generation = self.generation.wrapping_add(1);
        self.counts = Counts::default();
        self.probes_in_flight = 0;
        self.expiry = match self.state {
            CircuitState::Closed => {
                let interval = self.config.interval();
                (!interval.is_zero()).then(|| now + interval)
            }
            CircuitState::Open => Some(now + self.config.timeout()),
            CircuitState::HalfOpen => None,
        };
    }

    fn rejection(&self, now: Instant) -> Rejection {
        Rejection {
            breaker: self.config.name.clone(),
            state: self.state,
            retry_after: self.remaining_open(now),
        }
    }
}

/// Callback fired synchronously on every state change: `(breaker, from, to)`.
pub type StateListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Default listener: one structured log line per transition.
pub fn log_transition(name: &str, from: CircuitState, to: CircuitState) {
    match to {
        CircuitState::Open => {
            tracing::warn!(breaker = %name, from = %from, to = %to, "Circuit breaker opened")
        }
        CircuitState::HalfOpen => {
            tracing::info!(breaker = %name, from = %from, to = %to, "Circuit breaker probing")
        }
        CircuitState::Closed => {
            tracing::info!(breaker = %name, from = %from, to = %to, "Circuit breaker closed")
        }
    }
}

/// Thread-safe circuit breaker wrapping a [`BreakerCore`].
pub struct CircuitBreaker {
    name: String,
    core: Mutex<BreakerCore>,
    clock: SharedClock,
    metrics: SharedMetrics,
    listener: StateListener,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock, metrics: SharedMetrics) -> Self {
        let name = config.name.clone();
        let core = BreakerCore::new(config, clock.now());
        metrics.record_state(&name, CircuitState::Closed.as_str());
        Self {
            name,
            core: Mutex::new(core),
            clock,
            metrics,
            listener: Arc::new(log_transition),
        }
    }

    /// Replace the state-change listener.
    pub fn with_listener(mut self, listener: StateListener) -> Self {
        self.listener = listener;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. Pure read; an Open breaker whose cooldown has elapsed
    /// keeps reporting Open until the next admission attempt.
    pub fn state(&self) -> CircuitState {
        self.lock().state()
    }

    pub fn counts(&self) -> Counts {
        self.lock().counts()
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.lock().config().clone()
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> BreakerStatus {
        let now = self.clock.now();
        let core = self.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: core.state(),
            counts: core.counts(),
            retry_after_secs: core.remaining_open(now).map(|d| d.as_secs_f64()),
            failure_threshold: core.config().failure_threshold,
            min_requests: core.config().min_requests,
            timeout_secs: core.config().timeout_secs,
        }
    }

    /// Ask for admission. The returned permit must be resolved with
    /// [`Permit::success`] or [`Permit::failure`]; dropping it abandons the call.
    pub fn try_acquire(&self) -> Result<Permit<'_>, Rejection> {
        let (admission, transition) = {
            let mut core = self.lock();
            core.before_call(self.clock.now())
        };
        self.notify(transition);

        match admission {
            Ok(ticket) => Ok(Permit {
                breaker: self,
                ticket: Some(ticket),
            }),
            Err(rejection) => {
                self.metrics.record_breaker_outcome(&self.name, "rejected");
                tracing::debug!(breaker = %self.name, state = %rejection.state, "Call rejected");
                Err(rejection)
            }
        }
    }

    /// Run a synchronous call under the breaker.
    pub fn execute<T, E, F>(&self, f: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let permit = match self.try_acquire() {
            Ok(p) => p,
            Err(rejection) => return Outcome::Rejected(rejection),
        };
        match f() {
            Ok(v) => {
                permit.success();
                Outcome::Success(v)
            }
            Err(e) => {
                permit.failure();
                Outcome::Failed(e)
            }
        }
    }

    /// Run an async call under the breaker. Dropping the returned future
    /// abandons the call without counting it.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.try_acquire() {
            Ok(p) => p,
            Err(rejection) => return Outcome::Rejected(rejection),
        };
        match f().await {
            Ok(v) => {
                permit.success();
                Outcome::Success(v)
            }
            Err(e) => {
                permit.failure();
                Outcome::Failed(e)
            }
        }
    }

    /// Like [`CircuitBreaker::call`], but stops waiting when `cancel` fires.
    /// Cancellation is never counted as a dependency failure.
    pub async fn call_with_cancel<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            outcome = self.call(f) => outcome,
        }
    }

    fn complete(&self, ticket: Ticket, result: CallResult) {
        let transition = {
            let mut core = self.lock();
            core.after_call(self.clock.now(), ticket, result)
        };
        let outcome = match result {
            CallResult::Success => "success",
            CallResult::Failure => "failure",
            CallResult::Abandoned => "cancelled",
        };
        self.metrics.record_breaker_outcome(&self.name, outcome);
        self.notify(transition);
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };
        self.metrics.record_state(&self.name, to.as_str());
        let listener = &self.listener;
        if catch_unwind(AssertUnwindSafe(|| listener(&self.name, from, to))).is_err() {
            tracing::error!(breaker = %self.name, "State change listener panicked");
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// An admitted call. Resolve it exactly once; dropping it abandons the call.
#[must_use = "an unresolved permit is recorded as abandoned"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Option<Ticket>,
}

impl Permit<'_> {
    pub fn success(mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.complete(ticket, CallResult::Success);
        }
    }

    pub fn failure(mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.complete(ticket, CallResult::Failure);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.complete(ticket, CallResult::Abandoned);
        }
    }
}

/// Serializable breaker snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub counts: Counts,
    pub retry_after_secs: Option<f64>,
    pub failure_threshold: f64,
    pub min_requests: u32,
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::NoopMetrics;
    use crate::resilience::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: f64, min_requests: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: "test".into(),
            max_requests: 1,
            interval_secs: 60,
            timeout_secs: 30,
            failure_threshold: threshold,
            min_requests,
        }
    }

    fn fail(core: &mut BreakerCore, now: Instant) -> Option<Transition> {
        let (ticket, _) = core.before_call(now);
        core.after_call(now, ticket.unwrap(), CallResult::Failure)
    }

    fn succeed(core: &mut BreakerCore, now: Instant) -> Option<Transition> {
        let (ticket, _) = core.before_call(now);
        core.after_call(now, ticket.unwrap(), CallResult::Success)
    }

    #[test]
    fn test_no_trip_below_min_requests() {
        let now = Instant::now();
        let mut core = BreakerCore::new(config(0.6, 5), now);
        for _ in 0..4 {
            assert!(fail(&mut core, now).is_none());
        }
        assert_eq!(core.state(), CircuitState::Closed);
        assert_eq!(core.counts().total_failures, 4);
    }

    #[test]
    fn test_trips_once_ratio_and_sample_reached() {
        let now = Instant::now();
        let mut core = BreakerCore::new(config(0.6, 5), now);
        for _ in 0..4 {
            fail(&mut core, now);
        }
        succeed(&mut core, now);
        assert_eq!(core.state(), CircuitState::Closed);

        let t = fail(&mut core, now);
        assert_eq!(
            t,
            Some(Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            })
        );
        assert_eq!(core.counts(), Counts::default());
    }

    #[test]
    fn test_open_rejects_until_timeout_then_half_open() {
        let t0 = Instant::now();
        let mut core = BreakerCore::new(config(1.0, 1), t0);
        fail(&mut core, t0);
        assert_eq!(core.state(), CircuitState::Open);

        let (admission, _) = core.before_call(t0 + Duration::from_secs(29));
        let rejection = admission.unwrap_err();
        assert_eq!(rejection.state, CircuitState::Open);
        assert_eq!(rejection.retry_after, Some(Duration::from_secs(1)));

        let (admission, transition) = core.before_call(t0 + Duration::from_secs(30));
        assert!(admission.is_ok());
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::HalfOpen));

        // Probe budget of one is spent.
        let (second, _) = core.before_call(t0 + Duration::from_secs(30));
        assert_eq!(second.unwrap_err().state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let t0 = Instant::now();
        let mut core = BreakerCore::new(config(1.0, 1), t0);
        fail(&mut core, t0);
        let later = t0 + Duration::from_secs(31);
        let t = succeed(&mut core, later);
        assert_eq!(t.map(|t| t.to), Some(CircuitState::Closed));
        assert_eq!(core.counts(), Counts::default());
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let t0 = Instant::now();
        let mut core = BreakerCore::new(config(1.0, 1), t0);
        fail(&mut core, t0);
        let later = t0 + Duration::from_secs(31);
        let t = fail(&mut core, later);
        assert_eq!(t.map(|t| t.to), Some(CircuitState::Open));
        assert_eq!(core.remaining_open(later), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_abandoned_probe_releases_slot() {
        let t0 = Instant::now();
        let mut core = BreakerCore::new(config(1.0, 1), t0);
        fail(&mut core, t0);
        let later = t0 + Duration::from_secs(31);

        let (ticket, _) = core.before_call(later);
        core.after_call(later, ticket.unwrap(), CallResult::Abandoned);
        assert_eq!(core.state(), CircuitState::HalfOpen);
        assert_eq!(core.counts().requests, 0);

        let (again, _) = core.before_call(later);
        assert!(again.is_ok());
    }

    #[test]
    fn test_interval_resets_closed_counts() {
        let t0 = Instant::now();
        let mut core = BreakerCore::new(config(0.5, 5), t0);
        for _ in 0..4 {
            fail(&mut core, t0);
        }
        let later = t0 + Duration::from_secs(61);
        fail(&mut core, later);
        assert_eq!(core.state(), CircuitState::Closed);
        assert_eq!(core.counts().total_failures, 1);
    }

    #[test]
    fn test_stale_generation_result_is_ignored() {
        let t0 = Instant::now();
        let mut core = BreakerCore::new(config(0.5, 1), t0);
        let (slow, _) = core.before_call(t0);
        fail(&mut core, t0);
        assert_eq!(core.state(), CircuitState::Open);

        // The slow call started before the trip; its success must not close.
        assert!(core.after_call(t0, slow.unwrap(), CallResult::Success).is_none());
        assert_eq!(core.state(), CircuitState::Open);
    }

    #[test]
    fn test_state_reads_do_not_mutate() {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(config(1.0, 1), clock.clone(), NoopMetrics::shared());
        let _ = breaker.execute(|| Err::<(), _>("boom"));
        clock.advance(Duration::from_secs(120));

        for _ in 0..10 {
            assert_eq!(breaker.state(), CircuitState::Open);
            assert_eq!(breaker.counts(), Counts::default());
        }
    }

    #[test]
    fn test_execute_does_not_invoke_when_open() {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(config(1.0, 1), clock.clone(), NoopMetrics::shared());
        let _ = breaker.execute(|| Err::<(), _>("boom"));

        let calls = AtomicU32::new(0);
        let outcome: Outcome<(), &str> = breaker.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(outcome.is_rejected());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_panic_is_isolated() {
        let clock = Arc::new(ManualClock::new());
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        let breaker = CircuitBreaker::new(config(1.0, 1), clock, NoopMetrics::shared())
            .with_listener(Arc::new(move |_: &str, _: CircuitState, _: CircuitState| {
                seen2.fetch_add(1, Ordering::SeqCst);
                panic!("listener failure");
            }));

        let outcome = breaker.execute(|| Err::<(), _>("boom"));
        assert!(matches!(outcome, Outcome::Failed("boom")));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_cancelled_call_is_not_a_failure() {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(config(1.0, 1), clock, NoopMetrics::shared());
        let token = CancellationToken::new();
        token.cancel();

        let outcome: Outcome<(), &str> = breaker
            .call_with_cancel(&token, || async { Err("never runs") })
            .await;
        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().total_failures, 0);
    }
}
