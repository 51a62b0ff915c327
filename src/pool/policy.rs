//! Composable pool policies
//!
//! Policies extend pool behavior without touching the pool itself. Each
//! policy receives hooks at three points in the job lifecycle:
//! - `on_enqueue`: before queueing; an error rejects the job (first
//!   rejecting policy wins)
//! - `on_job_start`: when a worker picks the job up
//! - `on_job_complete`: when execution finishes, success or failure
//!
//! All hooks must be thread-safe; they run on submitter and worker threads.
//! Disabled policies still receive hooks but must no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::error::{EngineError, VoidResult};
use crate::job::Job;
use crate::queue::BackpressureQueue;

/// Lifecycle hooks for pool extension
pub trait PoolPolicy: Send + Sync {
    /// Called before a job is queued; an error rejects the job
    fn on_enqueue(&self, job: &Job) -> VoidResult;

    /// Called when a worker begins executing a job
    fn on_job_start(&self, job: &Job);

    /// Called when a job finishes
    fn on_job_complete(&self, job: &Job, success: bool, error: Option<&EngineError>);

    /// Policy name for identification and logging
    fn name(&self) -> &str;

    /// Whether the policy is active
    fn is_enabled(&self) -> bool {
        true
    }

    /// Enable or disable the policy
    fn set_enabled(&self, _enabled: bool) {}
}

/// Rejects new submissions while a shared circuit breaker is open
///
/// Admission is checked at enqueue so an open circuit fails submissions
/// fast without affecting in-flight work; outcomes are reported back to the
/// breaker at completion.
pub struct CircuitBreakerPolicy {
    breaker: Arc<CircuitBreaker>,
    enabled: AtomicBool,
}

impl CircuitBreakerPolicy {
    /// Create a policy around a (possibly shared) breaker
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            enabled: AtomicBool::new(true),
        }
    }

    /// The underlying breaker
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl PoolPolicy for CircuitBreakerPolicy {
    fn on_enqueue(&self, job: &Job) -> VoidResult {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.breaker.allow_request() {
            Ok(())
        } else {
            debug!(job_id = job.id(), "submission rejected, circuit open");
            Err(EngineError::CircuitOpen)
        }
    }

    fn on_job_start(&self, _job: &Job) {}

    fn on_job_complete(&self, _job: &Job, success: bool, error: Option<&EngineError>) {
        if !self.is_enabled() {
            return;
        }
        if success {
            self.breaker.record_success();
        } else {
            let fallback = EngineError::JobExecutionFailed("job failed".into());
            self.breaker.record_failure(error.unwrap_or(&fallback));
        }
    }

    fn name(&self) -> &str {
        "circuit_breaker_policy"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// Scaling suggestion produced by [`AutoscalePolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleHint {
    /// Load is high; more workers would help
    Up,
    /// Load is low; workers could be released
    Down,
}

/// Callback receiving scaling hints with the observed queue depth
pub type ScaleHintFn = Arc<dyn Fn(ScaleHint, usize) + Send + Sync>;

/// Observes queue utilization and emits scaling hints
///
/// The pool never resizes itself; this policy only surfaces the signal.
/// Hints are rate-limited by a cooldown so bursty traffic does not flood
/// the embedder.
pub struct AutoscalePolicy {
    queue: Arc<BackpressureQueue>,
    scale_up_ratio: f64,
    scale_down_ratio: f64,
    cooldown: Duration,
    hint: ScaleHintFn,
    last_hint: Mutex<Option<Instant>>,
    enabled: AtomicBool,
}

impl AutoscalePolicy {
    /// Create a policy watching `queue`, hinting through `hint`
    ///
    /// Up hints fire at 75% utilization, down hints at 25%, with a one
    /// second cooldown.
    pub fn new(queue: Arc<BackpressureQueue>, hint: ScaleHintFn) -> Self {
        Self {
            queue,
            scale_up_ratio: 0.75,
            scale_down_ratio: 0.25,
            cooldown: Duration::from_secs(1),
            hint,
            last_hint: Mutex::new(None),
            enabled: AtomicBool::new(true),
        }
    }

    /// Override the utilization thresholds
    pub fn with_thresholds(mut self, scale_up_ratio: f64, scale_down_ratio: f64) -> Self {
        self.scale_up_ratio = scale_up_ratio;
        self.scale_down_ratio = scale_down_ratio;
        self
    }

    /// Override the hint cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn maybe_hint(&self, hint: ScaleHint) {
        let mut last = self.last_hint.lock();
        let now = Instant::now();
        if let Some(previous) = *last {
            if now.duration_since(previous) < self.cooldown {
                return;
            }
        }
        *last = Some(now);
        drop(last);

        let depth = self.queue.len();
        debug!(?hint, depth, "autoscale hint");
        (self.hint)(hint, depth);
    }
}

impl PoolPolicy for AutoscalePolicy {
    fn on_enqueue(&self, _job: &Job) -> VoidResult {
        if self.is_enabled() && self.queue.pressure_ratio() >= self.scale_up_ratio {
            self.maybe_hint(ScaleHint::Up);
        }
        Ok(())
    }

    fn on_job_start(&self, _job: &Job) {}

    fn on_job_complete(&self, _job: &Job, _success: bool, _error: Option<&EngineError>) {
        if self.is_enabled() && self.queue.pressure_ratio() <= self.scale_down_ratio {
            self.maybe_hint(ScaleHint::Down);
        }
    }

    fn name(&self) -> &str {
        "autoscale_policy"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreakerConfig, CircuitState};
    use std::sync::atomic::AtomicUsize;

    fn job(name: &str) -> Job {
        Job::new(name, Box::new(|| Ok(())))
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            failure_rate_threshold: 0.0,
            open_duration: Duration::from_secs(60),
            ..Default::default()
        }))
    }

    #[test]
    fn test_breaker_policy_rejects_when_open() {
        let breaker = breaker();
        let policy = CircuitBreakerPolicy::new(breaker.clone());

        assert!(policy.on_enqueue(&job("a")).is_ok());
        policy.on_job_complete(
            &job("a"),
            false,
            Some(&EngineError::JobExecutionFailed("x".into())),
        );
        policy.on_job_complete(
            &job("b"),
            false,
            Some(&EngineError::JobExecutionFailed("y".into())),
        );

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            policy.on_enqueue(&job("c")),
            Err(EngineError::CircuitOpen)
        ));
    }

    #[test]
    fn test_disabled_breaker_policy_noops() {
        let breaker = breaker();
        let policy = CircuitBreakerPolicy::new(breaker.clone());
        policy.set_enabled(false);

        policy.on_job_complete(&job("a"), false, None);
        policy.on_job_complete(&job("b"), false, None);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(policy.on_enqueue(&job("c")).is_ok());
    }

    #[test]
    fn test_autoscale_hints_up_under_load() {
        let queue = Arc::new(BackpressureQueue::with_capacity(4).unwrap());
        let hints = Arc::new(Mutex::new(Vec::new()));

        let hints_clone = hints.clone();
        let policy = AutoscalePolicy::new(
            queue.clone(),
            Arc::new(move |hint, depth| {
                hints_clone.lock().push((hint, depth));
            }),
        )
        .with_cooldown(Duration::ZERO);

        for i in 0..3 {
            queue.enqueue(job(&format!("j{i}"))).unwrap();
        }
        assert!(policy.on_enqueue(&job("probe")).is_ok());

        let hints = hints.lock();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].0, ScaleHint::Up);
    }

    #[test]
    fn test_autoscale_hints_down_when_idle() {
        let queue = Arc::new(BackpressureQueue::with_capacity(4).unwrap());
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        let policy = AutoscalePolicy::new(
            queue,
            Arc::new(move |hint, _| {
                if hint == ScaleHint::Down {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .with_cooldown(Duration::ZERO);

        policy.on_job_complete(&job("a"), true, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_autoscale_cooldown_limits_hints() {
        let queue = Arc::new(BackpressureQueue::with_capacity(2).unwrap());
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        let policy = AutoscalePolicy::new(
            queue.clone(),
            Arc::new(move |_, _| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .with_cooldown(Duration::from_secs(60));

        queue.enqueue(job("a")).unwrap();
        queue.enqueue(job("b")).unwrap();
        for _ in 0..5 {
            let _ = policy.on_enqueue(&job("probe"));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
