//! Backpressure configuration and statistics
//!
//! Watermarks divide queue depth into graduated pressure bands:
//!
//! ```text
//! 0%                    50%              80%           100%
//! |------ none ---------|---- low -------|--- high ----|critical|
//!                    low_watermark    high_watermark  capacity
//! ```
//!
//! Rate limiting (token bucket) applies before any overflow policy, and the
//! adaptive policy steers between blocking and shedding based on an
//! estimated queue wait time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::job::Job;

/// Policy for handling queue overflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    /// Block until space is available, up to `block_timeout`
    Block,
    /// Drop the oldest queued job to make room
    DropOldest,
    /// Reject the incoming job
    DropNewest,
    /// Ask a user callback for a per-job decision
    Callback,
    /// Choose between blocking and shedding from observed latency
    Adaptive,
}

impl BackpressurePolicy {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressurePolicy::Block => "block",
            BackpressurePolicy::DropOldest => "drop_oldest",
            BackpressurePolicy::DropNewest => "drop_newest",
            BackpressurePolicy::Callback => "callback",
            BackpressurePolicy::Adaptive => "adaptive",
        }
    }
}

/// Decision returned by the callback policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureDecision {
    /// Admit the job if any space exists; reject if still full
    Accept,
    /// Reject with `queue_full`
    Reject,
    /// Drop the oldest job, then admit
    DropAndAccept,
    /// Sleep one adaptive sample interval and retry once
    Delay,
}

/// Graduated queue pressure derived from depth and watermarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PressureLevel {
    /// Below the low watermark
    None,
    /// Between the watermarks
    Low,
    /// At or above the high watermark
    High,
    /// At capacity
    Critical,
}

impl PressureLevel {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::None => "none",
            PressureLevel::Low => "low",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }
}

/// Callback invoked on every pressure-level transition with `(depth, ratio)`
pub type PressureCallback = Arc<dyn Fn(usize, f64) + Send + Sync>;

/// Callback deciding the fate of a job under the callback policy
pub type DecisionCallback = Arc<dyn Fn(&Job) -> BackpressureDecision + Send + Sync>;

/// Tunable estimator for the adaptive policy: `(depth, avg_service_time)`
/// to expected queue wait
pub type WaitEstimator = Arc<dyn Fn(usize, Duration) -> Duration + Send + Sync>;

/// Token-bucket rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether rate limiting applies to enqueue
    pub enabled: bool,
    /// Sustained throughput ceiling
    pub tokens_per_second: u64,
    /// Maximum tokens that can accumulate (longest admissible spike)
    pub burst_size: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tokens_per_second: 10_000,
            burst_size: 1_000,
        }
    }
}

/// Configuration for the backpressure queue
#[derive(Clone)]
pub struct BackpressureConfig {
    /// Overflow policy
    pub policy: BackpressurePolicy,
    /// Pressure falls back to none/low only below this fraction of capacity
    pub low_watermark: f64,
    /// Pressure rises to high at this fraction of capacity
    pub high_watermark: f64,
    /// Maximum block time for the block policy
    pub block_timeout: Duration,
    /// Token-bucket settings
    pub rate_limit: RateLimitConfig,
    /// Invoked on pressure transitions
    pub pressure_callback: Option<PressureCallback>,
    /// Required when `policy` is `Callback`
    pub decision_callback: Option<DecisionCallback>,
    /// Sampling/retry interval for the adaptive and callback-delay paths
    pub adaptive_sample_interval: Duration,
    /// Wait-time target for the adaptive policy
    pub adaptive_target_latency: Duration,
    /// Estimator override for the adaptive policy; defaults to
    /// `depth * avg_service_time`
    pub adaptive_wait_estimator: Option<WaitEstimator>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            policy: BackpressurePolicy::Block,
            low_watermark: 0.5,
            high_watermark: 0.8,
            block_timeout: Duration::from_secs(5),
            rate_limit: RateLimitConfig::default(),
            pressure_callback: None,
            decision_callback: None,
            adaptive_sample_interval: Duration::from_millis(100),
            adaptive_target_latency: Duration::from_millis(10),
            adaptive_wait_estimator: None,
        }
    }
}

impl BackpressureConfig {
    /// Validate watermark ordering, callback presence, and rate parameters
    pub fn validate(&self) -> EngineResult<()> {
        if !(0.0..1.0).contains(&self.low_watermark) {
            return Err(EngineError::InvalidArgument(format!(
                "low_watermark {} outside [0, 1)",
                self.low_watermark
            )));
        }
        if !(0.0..=1.0).contains(&self.high_watermark) {
            return Err(EngineError::InvalidArgument(format!(
                "high_watermark {} outside (0, 1]",
                self.high_watermark
            )));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(EngineError::InvalidArgument(format!(
                "low_watermark {} must be below high_watermark {}",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.policy == BackpressurePolicy::Callback && self.decision_callback.is_none() {
            return Err(EngineError::InvalidArgument(
                "callback policy requires a decision callback".into(),
            ));
        }
        if self.rate_limit.enabled {
            if self.rate_limit.tokens_per_second == 0 {
                return Err(EngineError::InvalidArgument(
                    "rate limit requires tokens_per_second > 0".into(),
                ));
            }
            if self.rate_limit.burst_size == 0 {
                return Err(EngineError::InvalidArgument(
                    "rate limit requires burst_size > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BackpressureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureConfig")
            .field("policy", &self.policy)
            .field("low_watermark", &self.low_watermark)
            .field("high_watermark", &self.high_watermark)
            .field("block_timeout", &self.block_timeout)
            .field("rate_limit", &self.rate_limit)
            .field("adaptive_sample_interval", &self.adaptive_sample_interval)
            .field("adaptive_target_latency", &self.adaptive_target_latency)
            .finish()
    }
}

/// Copyable snapshot of backpressure statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BackpressureStatsSnapshot {
    /// Jobs admitted into the queue
    pub jobs_accepted: u64,
    /// Jobs refused at admission
    pub jobs_rejected: u64,
    /// Queued jobs discarded to make room
    pub jobs_dropped: u64,
    /// Times rate limiting forced a wait
    pub rate_limit_waits: u64,
    /// Transitions into high or critical pressure
    pub pressure_events: u64,
    /// Total time spent blocked, in nanoseconds
    pub total_block_time_ns: u64,
}

impl BackpressureStatsSnapshot {
    /// `accepted / (accepted + rejected)`, or 1.0 with no attempts
    pub fn acceptance_rate(&self) -> f64 {
        let total = self.jobs_accepted + self.jobs_rejected;
        if total == 0 {
            return 1.0;
        }
        self.jobs_accepted as f64 / total as f64
    }

    /// Average block time per rate-limit wait, in milliseconds
    pub fn avg_block_time_ms(&self) -> f64 {
        if self.rate_limit_waits == 0 {
            return 0.0;
        }
        self.total_block_time_ns as f64 / self.rate_limit_waits as f64 / 1e6
    }
}

/// Thread-safe backpressure counters
#[derive(Debug, Default)]
pub struct BackpressureStats {
    pub(crate) jobs_accepted: AtomicU64,
    pub(crate) jobs_rejected: AtomicU64,
    pub(crate) jobs_dropped: AtomicU64,
    pub(crate) rate_limit_waits: AtomicU64,
    pub(crate) pressure_events: AtomicU64,
    pub(crate) total_block_time_ns: AtomicU64,
}

impl BackpressureStats {
    /// Reset all counters
    pub fn reset(&self) {
        self.jobs_accepted.store(0, Ordering::Relaxed);
        self.jobs_rejected.store(0, Ordering::Relaxed);
        self.jobs_dropped.store(0, Ordering::Relaxed);
        self.rate_limit_waits.store(0, Ordering::Relaxed);
        self.pressure_events.store(0, Ordering::Relaxed);
        self.total_block_time_ns.store(0, Ordering::Relaxed);
    }

    /// Copyable snapshot of the current counters
    pub fn snapshot(&self) -> BackpressureStatsSnapshot {
        BackpressureStatsSnapshot {
            jobs_accepted: self.jobs_accepted.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_dropped: self.jobs_dropped.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            pressure_events: self.pressure_events.load(Ordering::Relaxed),
            total_block_time_ns: self.total_block_time_ns.load(Ordering::Relaxed),
        }
    }
}

/// Queue health metrics independent of the backpressure counters
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub(crate) total_enqueued: AtomicU64,
    pub(crate) total_dequeued: AtomicU64,
    pub(crate) total_rejected: AtomicU64,
    pub(crate) total_timeouts: AtomicU64,
    pub(crate) peak_size: AtomicU64,
}

/// Copyable snapshot of [`QueueMetrics`]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    /// Jobs accepted over the queue's lifetime
    pub total_enqueued: u64,
    /// Jobs handed to consumers
    pub total_dequeued: u64,
    /// Jobs refused at admission
    pub total_rejected: u64,
    /// Blocking enqueues that timed out
    pub total_timeouts: u64,
    /// Highest observed depth
    pub peak_size: u64,
}

impl QueueMetricsSnapshot {
    /// `rejected / (enqueued + rejected)`, or 0.0 with no attempts
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_enqueued + self.total_rejected;
        if total == 0 {
            return 0.0;
        }
        self.total_rejected as f64 / total as f64
    }
}

impl QueueMetrics {
    /// Copyable snapshot of the current counters
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_dequeued: self.total_dequeued.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            peak_size: self.peak_size.load(Ordering::Relaxed),
        }
    }

    /// Best-effort peak tracking; bounded retries under contention
    pub(crate) fn observe_depth(&self, depth: usize) {
        let depth = depth as u64;
        let mut peak = self.peak_size.load(Ordering::Acquire);
        let mut retries = 0;
        while depth > peak && retries < 10 {
            match self.peak_size.compare_exchange(
                peak,
                depth,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => {
                    peak = current;
                    retries += 1;
                }
            }
        }
    }
}
