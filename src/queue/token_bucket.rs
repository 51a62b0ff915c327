//! Lock-free token bucket rate limiter
//!
//! Tokens accrue continuously at a fixed rate up to a burst cap; each
//! admitted operation consumes one or more tokens. Token counts are stored
//! as fixed-point integers (milli-tokens, factor 1000) so refill and acquire
//! are pure atomic integer operations; no timer thread and no float atomics.
//!
//! ```text
//! tokens = min(max_tokens, tokens + elapsed * rate)
//! if tokens >= requested { tokens -= requested; admitted }
//! ```

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Fixed-point scale: 1000 milli-tokens per token
const PRECISION_FACTOR: i64 = 1000;

/// Lock-free token bucket
///
/// The bucket starts full. All methods are safe for concurrent use; waiting
/// acquires spin with exponential backoff rather than parking.
pub struct TokenBucket {
    /// Milli-tokens currently available
    tokens: AtomicI64,
    /// Capacity in milli-tokens
    max_tokens: AtomicI64,
    /// Refill rate in milli-tokens per second
    rate_millitokens_per_sec: AtomicU64,
    /// Nanoseconds since `base` at the last refill
    last_refill_ns: AtomicU64,
    base: Instant,
}

impl TokenBucket {
    /// Create a bucket refilling at `tokens_per_second` with capacity `burst_size`
    pub fn new(tokens_per_second: u64, burst_size: u64) -> Self {
        let max = burst_size as i64 * PRECISION_FACTOR;
        Self {
            tokens: AtomicI64::new(max),
            max_tokens: AtomicI64::new(max),
            rate_millitokens_per_sec: AtomicU64::new(tokens_per_second * PRECISION_FACTOR as u64),
            last_refill_ns: AtomicU64::new(0),
            base: Instant::now(),
        }
    }

    /// Attempt to acquire tokens without waiting
    pub fn try_acquire(&self, tokens: u64) -> bool {
        self.refill();
        let needed = tokens as i64 * PRECISION_FACTOR;
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                if available >= needed {
                    Some(available - needed)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Attempt to acquire tokens, spin-waiting up to `timeout`
    ///
    /// Uses exponential backoff between attempts to keep the wait
    /// cooperative.
    pub fn try_acquire_for(&self, tokens: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_micros(10);

        loop {
            if self.try_acquire(tokens) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = deadline - now;
            std::thread::sleep(backoff.min(remaining));
            backoff = (backoff * 2).min(Duration::from_millis(1));
        }
    }

    /// Whole tokens currently available (snapshot)
    pub fn available_tokens(&self) -> u64 {
        self.refill();
        let tokens = self.tokens.load(Ordering::Acquire).max(0);
        (tokens / PRECISION_FACTOR) as u64
    }

    /// Time until `tokens` whole tokens would be available
    ///
    /// Zero if they already are; `Duration::MAX` if the rate is zero.
    pub fn time_until_available(&self, tokens: u64) -> Duration {
        self.refill();
        let needed = tokens as i64 * PRECISION_FACTOR;
        let available = self.tokens.load(Ordering::Acquire).max(0);
        if available >= needed {
            return Duration::ZERO;
        }
        let rate = self.rate_millitokens_per_sec.load(Ordering::Acquire);
        if rate == 0 {
            return Duration::MAX;
        }
        let deficit = (needed - available) as u64;
        Duration::from_secs_f64(deficit as f64 / rate as f64)
    }

    /// Update the refill rate; accumulated tokens are untouched
    pub fn set_rate(&self, tokens_per_second: u64) {
        self.rate_millitokens_per_sec
            .store(tokens_per_second * PRECISION_FACTOR as u64, Ordering::Release);
    }

    /// Update the capacity; excess accumulated tokens are discarded
    pub fn set_burst_size(&self, burst_size: u64) {
        let max = burst_size as i64 * PRECISION_FACTOR;
        self.max_tokens.store(max, Ordering::Release);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                if t > max {
                    Some(max)
                } else {
                    None
                }
            });
    }

    /// Current refill rate in whole tokens per second
    pub fn rate(&self) -> u64 {
        self.rate_millitokens_per_sec.load(Ordering::Acquire) / PRECISION_FACTOR as u64
    }

    /// Capacity in whole tokens
    pub fn burst_size(&self) -> u64 {
        (self.max_tokens.load(Ordering::Acquire) / PRECISION_FACTOR) as u64
    }

    /// Restore the bucket to full capacity
    pub fn reset(&self) {
        let max = self.max_tokens.load(Ordering::Acquire);
        self.tokens.store(max, Ordering::Release);
        self.last_refill_ns
            .store(self.base.elapsed().as_nanos() as u64, Ordering::Release);
    }

    /// Credit tokens for the time elapsed since the last refill
    ///
    /// One thread claims the elapsed window via CAS on the refill timestamp;
    /// the credited amount is clamped to the burst cap.
    fn refill(&self) {
        let now_ns = self.base.elapsed().as_nanos() as u64;
        let last_ns = self.last_refill_ns.load(Ordering::Acquire);
        if now_ns <= last_ns {
            return;
        }

        if self
            .last_refill_ns
            .compare_exchange(last_ns, now_ns, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread claimed this window.
            return;
        }

        let elapsed_ns = (now_ns - last_ns) as u128;
        let rate = self.rate_millitokens_per_sec.load(Ordering::Acquire) as u128;
        let credit = (elapsed_ns * rate / 1_000_000_000) as i64;
        if credit == 0 {
            // Too little time has passed to mint a milli-token; give the
            // window back (only if no one else claimed it since) so the
            // fraction is not lost.
            let _ = self.last_refill_ns.compare_exchange(
                now_ns,
                last_ns,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return;
        }

        let max = self.max_tokens.load(Ordering::Acquire);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some((t + credit).min(max))
            });
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate())
            .field("burst_size", &self.burst_size())
            .field("available", &(self.tokens.load(Ordering::Relaxed) / PRECISION_FACTOR))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(100, 10);
        assert_eq!(bucket.available_tokens(), 10);
    }

    #[test]
    fn test_acquire_consumes_tokens() {
        let bucket = TokenBucket::new(1, 5);
        assert!(bucket.try_acquire(3));
        assert_eq!(bucket.available_tokens(), 2);
        assert!(bucket.try_acquire(2));
        assert!(!bucket.try_acquire(1));
    }

    #[test]
    fn test_tokens_never_exceed_burst() {
        let bucket = TokenBucket::new(1_000_000, 4);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(bucket.available_tokens(), 4);
    }

    #[test]
    fn test_refill_over_time() {
        let bucket = TokenBucket::new(1000, 1000);
        assert!(bucket.try_acquire(1000));
        assert_eq!(bucket.available_tokens(), 0);

        std::thread::sleep(Duration::from_millis(50));
        let refilled = bucket.available_tokens();
        // 1000 tokens/s for >= 50ms should mint at least 40 tokens even on
        // a loaded machine.
        assert!(refilled >= 40, "only {refilled} tokens refilled");
    }

    #[test]
    fn test_try_acquire_for_waits_for_refill() {
        let bucket = TokenBucket::new(200, 1);
        assert!(bucket.try_acquire(1));

        let start = Instant::now();
        assert!(bucket.try_acquire_for(1, Duration::from_secs(1)));
        // 1 token at 200/s arrives after ~5ms.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_try_acquire_for_times_out() {
        let bucket = TokenBucket::new(1, 1);
        assert!(bucket.try_acquire(1));
        assert!(!bucket.try_acquire_for(1, Duration::from_millis(30)));
    }

    #[test]
    fn test_time_until_available() {
        let bucket = TokenBucket::new(100, 10);
        assert_eq!(bucket.time_until_available(5), Duration::ZERO);

        assert!(bucket.try_acquire(10));
        let wait = bucket.time_until_available(1);
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(15));
    }

    #[test]
    fn test_shrinking_burst_discards_excess() {
        let bucket = TokenBucket::new(100, 10);
        bucket.set_burst_size(3);
        assert_eq!(bucket.available_tokens(), 3);
        assert_eq!(bucket.burst_size(), 3);
    }

    #[test]
    fn test_reset_restores_full_bucket() {
        let bucket = TokenBucket::new(1, 8);
        assert!(bucket.try_acquire(8));
        bucket.reset();
        assert_eq!(bucket.available_tokens(), 8);
    }

    #[test]
    fn test_concurrent_acquire_never_oversubscribes() {
        use std::sync::atomic::AtomicU64;
        use std::sync::Arc;

        let bucket = Arc::new(TokenBucket::new(1, 100));
        let acquired = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                let acquired = acquired.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if bucket.try_acquire(1) {
                            acquired.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("acquirer thread panicked");
        }

        // 100 burst tokens plus at most a handful refilled during the run.
        assert!(acquired.load(Ordering::Relaxed) <= 105);
    }
}
