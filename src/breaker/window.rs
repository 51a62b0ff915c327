//! Sliding failure window
//!
//! Time-bucketed success/failure counters for the circuit breaker. The
//! window is split into `bucket_count` buckets, each covering
//! `window / bucket_count`. Records land in the bucket for the current
//! instant; a bucket whose stamp has aged past the window is reset before
//! it is reused, and aged buckets are excluded from reads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct Bucket {
    successes: AtomicU64,
    failures: AtomicU64,
    /// Seconds since window creation when this bucket last started, -1 when
    /// never used
    started_sec: AtomicI64,
}

/// Sliding window of success/failure counts
pub struct FailureWindow {
    window: Duration,
    bucket_duration_secs: u64,
    buckets: Vec<Bucket>,
    base: Instant,
}

impl FailureWindow {
    /// Default bucket count
    pub const DEFAULT_BUCKET_COUNT: usize = 10;

    /// Create a window covering `window`, split into `bucket_count` buckets
    ///
    /// Bucket duration is at least one second; windows shorter than the
    /// bucket count are rounded up accordingly.
    pub fn new(window: Duration, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let bucket_duration_secs = (window.as_secs() / bucket_count as u64).max(1);
        let buckets = (0..bucket_count)
            .map(|_| Bucket {
                successes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                started_sec: AtomicI64::new(-1),
            })
            .collect();
        Self {
            window,
            bucket_duration_secs,
            buckets,
            base: Instant::now(),
        }
    }

    /// Window with the default bucket count
    pub fn with_duration(window: Duration) -> Self {
        Self::new(window, Self::DEFAULT_BUCKET_COUNT)
    }

    /// Record one success
    pub fn record_success(&self) {
        let bucket = self.current_bucket();
        bucket.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one failure
    pub fn record_failure(&self) {
        let bucket = self.current_bucket();
        bucket.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Successes within the window
    pub fn success_count(&self) -> u64 {
        self.sum(|b| b.successes.load(Ordering::Relaxed))
    }

    /// Failures within the window
    pub fn failure_count(&self) -> u64 {
        self.sum(|b| b.failures.load(Ordering::Relaxed))
    }

    /// Total requests within the window
    pub fn total_requests(&self) -> u64 {
        self.sum(|b| {
            b.successes.load(Ordering::Relaxed) + b.failures.load(Ordering::Relaxed)
        })
    }

    /// Failure ratio within the window, 0.0 when empty
    pub fn failure_rate(&self) -> f64 {
        let mut successes = 0u64;
        let mut failures = 0u64;
        let now_sec = self.now_sec();
        for bucket in &self.buckets {
            if self.is_live(bucket, now_sec) {
                successes += bucket.successes.load(Ordering::Relaxed);
                failures += bucket.failures.load(Ordering::Relaxed);
            }
        }
        let total = successes + failures;
        if total == 0 {
            return 0.0;
        }
        failures as f64 / total as f64
    }

    /// Reset all buckets
    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.successes.store(0, Ordering::Relaxed);
            bucket.failures.store(0, Ordering::Relaxed);
            bucket.started_sec.store(-1, Ordering::Relaxed);
        }
    }

    fn now_sec(&self) -> i64 {
        self.base.elapsed().as_secs() as i64
    }

    fn is_live(&self, bucket: &Bucket, now_sec: i64) -> bool {
        let started = bucket.started_sec.load(Ordering::Acquire);
        started >= 0 && ((now_sec - started) as u64) < self.window.as_secs().max(1)
    }

    fn sum<F: Fn(&Bucket) -> u64>(&self, read: F) -> u64 {
        let now_sec = self.now_sec();
        self.buckets
            .iter()
            .filter(|b| self.is_live(b, now_sec))
            .map(read)
            .sum()
    }

    /// Locate the bucket for the current instant, resetting it if stale
    fn current_bucket(&self) -> &Bucket {
        let now_sec = self.now_sec();
        let slot = (now_sec as u64 / self.bucket_duration_secs) as usize % self.buckets.len();
        let bucket = &self.buckets[slot];
        let bucket_start = now_sec - now_sec % self.bucket_duration_secs as i64;

        let started = bucket.started_sec.load(Ordering::Acquire);
        if started != bucket_start {
            // First writer for this slot period clears the stale counters.
            if bucket
                .started_sec
                .compare_exchange(started, bucket_start, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                bucket.successes.store(0, Ordering::Relaxed);
                bucket.failures.store(0, Ordering::Relaxed);
            }
        }
        bucket
    }
}

impl std::fmt::Debug for FailureWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureWindow")
            .field("window", &self.window)
            .field("buckets", &self.buckets.len())
            .field("successes", &self.success_count())
            .field("failures", &self.failure_count())
            .finish()
    }
}
