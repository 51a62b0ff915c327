//! Retry policies with configurable backoff
//!
//! A [`RetryPolicy`] travels with a job and governs whether a worker
//! re-enqueues it after a retryable failure. Strategies:
//! - **none**: fail immediately
//! - **fixed**: constant delay between attempts
//! - **linear**: delay grows as `initial_delay * attempt`, capped
//! - **exponential**: delay grows as `initial_delay * multiplier^(attempt-1)`,
//!   capped, with optional jitter to avoid thundering herds

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy for computing the delay between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// No retry
    None,
    /// Fixed delay between retries
    Fixed,
    /// Linearly increasing delay
    Linear,
    /// Exponentially increasing delay with optional jitter
    ExponentialBackoff,
}

/// Retry behavior attached to a job
///
/// The policy tracks its own attempt counter; the executing worker calls
/// [`record_attempt`](RetryPolicy::record_attempt) after each failure and
/// consults [`has_attempts_remaining`](RetryPolicy::has_attempts_remaining)
/// before re-enqueueing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    use_jitter: bool,
    current_attempt: usize,
}

impl RetryPolicy {
    /// Policy that disables retry
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            use_jitter: false,
            current_attempt: 0,
        }
    }

    /// Fixed delay between attempts
    ///
    /// `max_attempts` includes the initial attempt; a value of 1 is
    /// equivalent to [`none`](RetryPolicy::none).
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            use_jitter: false,
            current_attempt: 0,
        }
    }

    /// Linearly increasing delay: `initial_delay * attempt`, capped at `max_delay`
    pub fn linear(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            max_attempts: max_attempts.max(1),
            initial_delay,
            multiplier: 1.0,
            max_delay,
            use_jitter: false,
            current_attempt: 0,
        }
    }

    /// Exponential backoff with defaults: 100ms initial, 2.0 multiplier, 30s cap
    pub fn exponential_backoff(max_attempts: usize) -> Self {
        Self::exponential(
            max_attempts,
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(30),
            false,
        )
    }

    /// Fully specified exponential backoff
    pub fn exponential(
        max_attempts: usize,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        use_jitter: bool,
    ) -> Self {
        Self {
            strategy: RetryStrategy::ExponentialBackoff,
            max_attempts: max_attempts.max(1),
            initial_delay,
            multiplier,
            max_delay,
            use_jitter,
            current_attempt: 0,
        }
    }

    /// The configured strategy
    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    /// Maximum attempts including the initial execution
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Base delay for the first retry
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Exponential multiplier
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Delay cap
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether jitter is applied to exponential delays
    pub fn uses_jitter(&self) -> bool {
        self.use_jitter
    }

    /// Whether this policy ever retries
    pub fn is_retry_enabled(&self) -> bool {
        self.strategy != RetryStrategy::None && self.max_attempts > 1
    }

    /// Zero-based count of failed attempts recorded so far
    pub fn current_attempt(&self) -> usize {
        self.current_attempt
    }

    /// Whether another attempt is permitted
    pub fn has_attempts_remaining(&self) -> bool {
        self.is_retry_enabled() && self.current_attempt < self.max_attempts - 1
    }

    /// Record a failed attempt
    pub fn record_attempt(&mut self) {
        self.current_attempt += 1;
    }

    /// Reset the attempt counter
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Delay to sleep before the current retry attempt
    ///
    /// Returns zero before any attempt has been recorded and for the `none`
    /// strategy. Jitter multiplies the computed exponential delay by a
    /// uniform random factor in `[0, 1]`.
    pub fn delay_for_current_attempt(&self) -> Duration {
        if self.strategy == RetryStrategy::None || self.current_attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed => self.initial_delay,
            RetryStrategy::Linear => self
                .initial_delay
                .saturating_mul(self.current_attempt as u32),
            RetryStrategy::ExponentialBackoff => {
                let factor = self.multiplier.powi(self.current_attempt as i32 - 1);
                let millis = self.initial_delay.as_secs_f64() * 1000.0 * factor;
                Duration::from_millis(millis.min(u64::MAX as f64) as u64)
            }
        };

        let capped = delay.min(self.max_delay);

        if self.use_jitter && self.strategy == RetryStrategy::ExponentialBackoff {
            capped.mul_f64(fastrand::f64())
        } else {
            capped
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.strategy {
            RetryStrategy::None => write!(f, "retry(none)"),
            RetryStrategy::Fixed => write!(
                f,
                "retry(fixed, attempts={}, delay={}ms)",
                self.max_attempts,
                self.initial_delay.as_millis()
            ),
            RetryStrategy::Linear => write!(
                f,
                "retry(linear, attempts={}, initial={}ms)",
                self.max_attempts,
                self.initial_delay.as_millis()
            ),
            RetryStrategy::ExponentialBackoff => write!(
                f,
                "retry(exponential, attempts={}, initial={}ms, multiplier={})",
                self.max_attempts,
                self.initial_delay.as_millis(),
                self.multiplier
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.is_retry_enabled());
        assert!(!policy.has_attempts_remaining());
        assert_eq!(policy.delay_for_current_attempt(), Duration::ZERO);
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let mut policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        assert!(policy.has_attempts_remaining());

        policy.record_attempt();
        assert_eq!(policy.delay_for_current_attempt(), Duration::from_millis(100));

        policy.record_attempt();
        assert_eq!(policy.delay_for_current_attempt(), Duration::from_millis(100));
        assert!(!policy.has_attempts_remaining());
    }

    #[test]
    fn test_linear_delay_grows_and_caps() {
        let mut policy = RetryPolicy::linear(
            5,
            Duration::from_millis(100),
            Duration::from_millis(250),
        );

        policy.record_attempt();
        assert_eq!(policy.delay_for_current_attempt(), Duration::from_millis(100));

        policy.record_attempt();
        assert_eq!(policy.delay_for_current_attempt(), Duration::from_millis(200));

        policy.record_attempt();
        assert_eq!(policy.delay_for_current_attempt(), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let mut policy = RetryPolicy::exponential(
            6,
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(500),
            false,
        );

        policy.record_attempt();
        assert_eq!(policy.delay_for_current_attempt(), Duration::from_millis(100));

        policy.record_attempt();
        assert_eq!(policy.delay_for_current_attempt(), Duration::from_millis(200));

        policy.record_attempt();
        assert_eq!(policy.delay_for_current_attempt(), Duration::from_millis(400));

        policy.record_attempt();
        assert_eq!(policy.delay_for_current_attempt(), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_computed_delay() {
        let mut policy = RetryPolicy::exponential(
            4,
            Duration::from_millis(200),
            2.0,
            Duration::from_secs(10),
            true,
        );
        policy.record_attempt();
        policy.record_attempt();

        for _ in 0..32 {
            let delay = policy.delay_for_current_attempt();
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_reset_restores_attempts() {
        let mut policy = RetryPolicy::fixed(2, Duration::from_millis(10));
        policy.record_attempt();
        assert!(!policy.has_attempts_remaining());

        policy.reset();
        assert!(policy.has_attempts_remaining());
        assert_eq!(policy.current_attempt(), 0);
    }

    #[test]
    fn test_single_attempt_policies_do_not_retry() {
        let policy = RetryPolicy::fixed(1, Duration::from_millis(10));
        assert!(!policy.is_retry_enabled());
    }
}
