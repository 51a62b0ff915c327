//! Circuit breaker
//!
//! A three-state guard that short-circuits requests when a downstream is
//! unhealthy. Failures are tracked both as a consecutive counter and through
//! a sliding [`FailureWindow`]; either crossing its threshold opens the
//! circuit. After `open_duration` the breaker admits a bounded number of
//! half-open probes; enough successes close it, any failure reopens it.
//!
//! ```text
//!        failures >= threshold OR windowed rate >= rate_threshold
//!   CLOSED ------------------------------------------------> OPEN
//!     ^                                                        |
//!     | half-open successes >= success_threshold      open_duration elapsed
//!     |                                                        v
//!     +----------------------------------------------------HALF_OPEN
//!                        any half-open failure -> OPEN
//! ```
//!
//! State transitions are serialized under a mutex; counters are relaxed
//! atomics. The breaker may be shared across policies and pools.

pub mod window;

pub use window::FailureWindow;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::events::{self, EngineEvent, SharedSink};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; all requests admitted
    Closed,
    /// Failing; requests rejected without running
    Open,
    /// Testing recovery with a bounded number of probes
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

fn state_to_u8(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    }
}

fn state_from_u8(value: u8) -> CircuitState {
    match value {
        0 => CircuitState::Closed,
        1 => CircuitState::Open,
        _ => CircuitState::HalfOpen,
    }
}

/// Predicate deciding whether an error counts against the breaker
pub type FailurePredicate = Arc<dyn Fn(&EngineError) -> bool + Send + Sync>;

/// Circuit breaker configuration
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// Windowed failure rate that opens the circuit (0.0 disables)
    pub failure_rate_threshold: f64,
    /// Span of the sliding failure window
    pub window_duration: Duration,
    /// How long the circuit stays open before probing
    pub open_duration: Duration,
    /// Probe budget in the half-open state
    pub half_open_max_requests: usize,
    /// Probe successes required to close
    pub half_open_success_threshold: usize,
    /// When present and returning false, the failure is ignored
    pub failure_predicate: Option<FailurePredicate>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            window_duration: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 3,
            half_open_success_threshold: 3,
            failure_predicate: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate thresholds, the window span, and the half-open probe budget
    pub fn validate(&self) -> EngineResult<()> {
        if self.failure_threshold == 0 {
            return Err(EngineError::InvalidArgument(
                "failure_threshold must be nonzero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(EngineError::InvalidArgument(format!(
                "failure_rate_threshold {} outside [0, 1]",
                self.failure_rate_threshold
            )));
        }
        if self.window_duration.is_zero() {
            return Err(EngineError::InvalidArgument(
                "window_duration must be nonzero".into(),
            ));
        }
        if self.half_open_max_requests == 0 {
            return Err(EngineError::InvalidArgument(
                "half_open_max_requests must be nonzero".into(),
            ));
        }
        if self.half_open_success_threshold == 0
            || self.half_open_success_threshold > self.half_open_max_requests
        {
            // A threshold outside the probe budget can never close the
            // circuit again.
            return Err(EngineError::InvalidArgument(format!(
                "half_open_success_threshold {} outside 1..={}",
                self.half_open_success_threshold, self.half_open_max_requests
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("window_duration", &self.window_duration)
            .field("open_duration", &self.open_duration)
            .field("half_open_max_requests", &self.half_open_max_requests)
            .field("half_open_success_threshold", &self.half_open_success_threshold)
            .finish()
    }
}

/// Point-in-time breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// When the current state was entered
    pub state_since: Instant,
    /// All admission decisions made
    pub total_requests: u64,
    /// Requests that ran and succeeded
    pub successful_requests: u64,
    /// Requests that ran and failed
    pub failed_requests: u64,
    /// Requests rejected without running
    pub rejected_requests: u64,
    /// Failure rate within the sliding window
    pub failure_rate: f64,
    /// Current consecutive-failure streak
    pub consecutive_failures: u64,
    /// Number of state transitions since creation
    pub state_transitions: u64,
}

struct TransitionState {
    open_since: Option<Instant>,
    state_since: Instant,
}

/// Three-state circuit breaker with a sliding failure window
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    transition: Mutex<TransitionState>,
    window: FailureWindow,
    consecutive_failures: AtomicU64,
    half_open_requests: AtomicU64,
    half_open_successes: AtomicU64,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rejected_requests: AtomicU64,
    state_transitions: AtomicU64,
    sink: Mutex<SharedSink>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let window = FailureWindow::with_duration(config.window_duration);
        Self {
            config,
            state: AtomicU8::new(state_to_u8(CircuitState::Closed)),
            transition: Mutex::new(TransitionState {
                open_since: None,
                state_since: Instant::now(),
            }),
            window,
            consecutive_failures: AtomicU64::new(0),
            half_open_requests: AtomicU64::new(0),
            half_open_successes: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
            sink: Mutex::new(events::null_sink()),
        }
    }

    /// Install the event sink used for state-change events
    pub fn set_event_sink(&self, sink: SharedSink) {
        *self.sink.lock() = sink;
    }

    /// Decide whether a request may proceed
    ///
    /// In the open state this also performs the open-to-half-open transition
    /// once `open_duration` has elapsed. Rejected requests are counted and
    /// never run.
    pub fn allow_request(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match self.current_state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let mut transition = self.transition.lock();
                let elapsed_open = transition
                    .open_since
                    .map(|t| t.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if self.current_state() == CircuitState::Open && elapsed_open {
                    self.half_open_requests.store(0, Ordering::Relaxed);
                    self.half_open_successes.store(0, Ordering::Relaxed);
                    self.transition_locked(&mut transition, CircuitState::HalfOpen);
                    drop(transition);
                    return self.admit_half_open();
                }
                drop(transition);
                if self.current_state() == CircuitState::HalfOpen {
                    return self.admit_half_open();
                }
                self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                false
            }
            CircuitState::HalfOpen => self.admit_half_open(),
        }
    }

    fn admit_half_open(&self) -> bool {
        let budget = self.config.half_open_max_requests as u64;
        let admitted = self
            .half_open_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count < budget {
                    Some(count + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if !admitted {
            self.rejected_requests.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Record a completed, successful request
    pub fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.window.record_success();

        if self.current_state() == CircuitState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.half_open_success_threshold as u64 {
                let mut transition = self.transition.lock();
                if self.current_state() == CircuitState::HalfOpen {
                    self.transition_locked(&mut transition, CircuitState::Closed);
                }
            }
        }
    }

    /// Record a completed, failed request
    ///
    /// Consults the failure predicate first; ignored failures leave all
    /// state untouched.
    pub fn record_failure(&self, error: &EngineError) {
        if let Some(predicate) = self.config.failure_predicate.as_ref() {
            if !predicate(error) {
                return;
            }
        }

        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.window.record_failure();
        let streak = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.current_state() {
            CircuitState::Closed => {
                if self.should_open(streak) {
                    let mut transition = self.transition.lock();
                    if self.current_state() == CircuitState::Closed {
                        self.transition_locked(&mut transition, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                let mut transition = self.transition.lock();
                if self.current_state() == CircuitState::HalfOpen {
                    self.transition_locked(&mut transition, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn should_open(&self, consecutive: u64) -> bool {
        if consecutive >= self.config.failure_threshold as u64 {
            return true;
        }
        if self.config.failure_rate_threshold > 0.0 {
            // Rate path requires at least failure_threshold samples in the
            // window.
            let total = self.window.total_requests();
            if total >= self.config.failure_threshold as u64
                && self.window.failure_rate() >= self.config.failure_rate_threshold
            {
                return true;
            }
        }
        false
    }

    /// Current state (lock-free read)
    pub fn state(&self) -> CircuitState {
        self.current_state()
    }

    /// Manually open the circuit
    pub fn trip(&self) {
        let mut transition = self.transition.lock();
        if self.current_state() != CircuitState::Open {
            self.transition_locked(&mut transition, CircuitState::Open);
        }
    }

    /// Manually close the circuit and clear failure history
    pub fn reset(&self) {
        let mut transition = self.transition.lock();
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.half_open_requests.store(0, Ordering::Relaxed);
        self.half_open_successes.store(0, Ordering::Relaxed);
        self.window.reset();
        if self.current_state() != CircuitState::Closed {
            self.transition_locked(&mut transition, CircuitState::Closed);
        }
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let transition = self.transition.lock();
        CircuitBreakerStats {
            state: self.current_state(),
            state_since: transition.state_since,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            failure_rate: self.window.failure_rate(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }

    /// RAII guard that checks admission and records the outcome
    pub fn make_guard(&self) -> CircuitGuard<'_> {
        CircuitGuard::new(self)
    }

    fn current_state(&self) -> CircuitState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition_locked(&self, transition: &mut TransitionState, new_state: CircuitState) {
        let old_state = self.current_state();
        if old_state == new_state {
            return;
        }
        self.state.store(state_to_u8(new_state), Ordering::Release);
        transition.state_since = Instant::now();
        transition.open_since = match new_state {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };
        self.state_transitions.fetch_add(1, Ordering::Relaxed);

        let sink = self.sink.lock().clone();
        events::emit(
            &sink,
            EngineEvent::CircuitStateChanged {
                old: old_state.as_str(),
                new: new_state.as_str(),
            },
        );
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.current_state())
            .field("consecutive_failures", &self.consecutive_failures.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII guard for breaker-protected operations
///
/// Checks [`CircuitBreaker::allow_request`] on construction. A guard
/// dropped without an explicit mark records a failure.
pub struct CircuitGuard<'a> {
    breaker: &'a CircuitBreaker,
    allowed: bool,
    recorded: bool,
}

impl<'a> CircuitGuard<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        let allowed = breaker.allow_request();
        Self {
            breaker,
            allowed,
            recorded: !allowed,
        }
    }

    /// Whether the request was admitted
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Record success
    pub fn mark_success(&mut self) {
        if self.allowed && !self.recorded {
            self.recorded = true;
            self.breaker.record_success();
        }
    }

    /// Record failure
    pub fn mark_failure(&mut self, error: &EngineError) {
        if self.allowed && !self.recorded {
            self.recorded = true;
            self.breaker.record_failure(error);
        }
    }
}

impl Drop for CircuitGuard<'_> {
    fn drop(&mut self) {
        if self.allowed && !self.recorded {
            self.breaker.record_failure(&EngineError::Unknown(
                "operation dropped without recording an outcome".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> EngineError {
        EngineError::JobExecutionFailed("downstream".into())
    }

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_rate_threshold: 0.0,
            window_duration: Duration::from_secs(10),
            open_duration: Duration::from_millis(100),
            half_open_max_requests: 2,
            half_open_success_threshold: 2,
            failure_predicate: None,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(fast_config().validate().is_ok());

        let zero_threshold = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_threshold.validate(),
            Err(EngineError::InvalidArgument(_))
        ));

        let bad_rate = CircuitBreakerConfig {
            failure_rate_threshold: 1.5,
            ..Default::default()
        };
        assert!(bad_rate.validate().is_err());

        let no_probes = CircuitBreakerConfig {
            half_open_max_requests: 0,
            ..Default::default()
        };
        assert!(no_probes.validate().is_err());

        // A success threshold above the probe budget can never be met.
        let unreachable_close = CircuitBreakerConfig {
            half_open_max_requests: 2,
            half_open_success_threshold: 3,
            ..Default::default()
        };
        assert!(unreachable_close.validate().is_err());
    }

    #[test]
    fn test_closed_allows_everything() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..10 {
            assert!(breaker.allow_request());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            assert!(breaker.allow_request());
            breaker.record_failure(&failure());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
        assert_eq!(breaker.stats().rejected_requests, 1);
    }

    #[test]
    fn test_success_resets_streak() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure(&failure());
        breaker.record_failure(&failure());
        breaker.record_success();
        breaker.record_failure(&failure());
        breaker.record_failure(&failure());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_recovers_through_half_open() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure(&failure());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(110));

        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure(&failure());
        }
        std::thread::sleep(Duration::from_millis(110));
        assert!(breaker.allow_request());

        breaker.record_failure(&failure());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_budget_enforced() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure(&failure());
        }
        std::thread::sleep(Duration::from_millis(110));

        assert!(breaker.allow_request());
        assert!(breaker.allow_request());
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_rate_threshold_opens() {
        let config = CircuitBreakerConfig {
            failure_threshold: 100,
            failure_rate_threshold: 0.5,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new(config);

        // 60 failures / 120 requests crosses the 50% rate with a full
        // sample, while never reaching the consecutive threshold.
        for _ in 0..120 {
            breaker.record_success();
            breaker.record_failure(&failure());
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_failure_predicate_filters() {
        let config = CircuitBreakerConfig {
            failure_predicate: Some(Arc::new(|err| {
                !matches!(err, EngineError::OperationCanceled(_))
            })),
            ..fast_config()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..5 {
            breaker.record_failure(&EngineError::OperationCanceled("user".into()));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failed_requests, 0);
    }

    #[test]
    fn test_trip_and_reset() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.trip();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_guard_records_failure_by_default() {
        let breaker = Arc::new(CircuitBreaker::new(fast_config()));
        {
            let guard = breaker.make_guard();
            assert!(guard.is_allowed());
            // Dropped without marking.
        }
        assert_eq!(breaker.stats().failed_requests, 1);
    }

    #[test]
    fn test_guard_success_path() {
        let breaker = Arc::new(CircuitBreaker::new(fast_config()));
        {
            let mut guard = breaker.make_guard();
            guard.mark_success();
        }
        let stats = breaker.stats();
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.failed_requests, 0);
    }

    #[test]
    fn test_counter_identity() {
        let breaker = Arc::new(CircuitBreaker::new(fast_config()));
        for i in 0..10 {
            if breaker.allow_request() {
                if i % 2 == 0 {
                    breaker.record_success();
                } else {
                    breaker.record_failure(&failure());
                }
            }
        }
        let stats = breaker.stats();
        assert_eq!(
            stats.total_requests,
            stats.successful_requests + stats.failed_requests + stats.rejected_requests
        );
    }
}
