//! Bounded FIFO job queue with backpressure
//!
//! Admission control happens in three stages: the token-bucket rate limiter
//! (when enabled), the capacity check, and the configured overflow policy.
//! Pressure level is published through lock-free atomics with hysteresis so
//! observers never see flapping between the watermarks, and every transition
//! fires the pressure callback and an engine event.
//!
//! Queue internals are one mutex and two condition variables: `not_empty`
//! parks consumers, `space_available` parks producers under the block
//! policy. Stopping the queue is permanent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::trace;

use crate::error::{EngineError, EngineResult, VoidResult};
use crate::events::{self, EngineEvent, SharedSink};
use crate::job::Job;
use crate::queue::config::{
    BackpressureConfig, BackpressureDecision, BackpressurePolicy, BackpressureStats,
    BackpressureStatsSnapshot, PressureLevel, QueueMetrics, QueueMetricsSnapshot,
};
use crate::queue::token_bucket::TokenBucket;

struct QueueInner {
    items: VecDeque<Job>,
    stopped: bool,
}

fn level_to_u8(level: PressureLevel) -> u8 {
    match level {
        PressureLevel::None => 0,
        PressureLevel::Low => 1,
        PressureLevel::High => 2,
        PressureLevel::Critical => 3,
    }
}

fn level_from_u8(value: u8) -> PressureLevel {
    match value {
        0 => PressureLevel::None,
        1 => PressureLevel::Low,
        2 => PressureLevel::High,
        _ => PressureLevel::Critical,
    }
}

/// Bounded FIFO queue with watermark-driven backpressure and rate limiting
pub struct BackpressureQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    space_available: Condvar,
    config: RwLock<BackpressureConfig>,
    rate_limiter: RwLock<Option<Arc<TokenBucket>>>,
    current_pressure: AtomicU8,
    stats: BackpressureStats,
    metrics: QueueMetrics,
    /// EWMA of observed job service time, fed by the pool
    avg_service_ns: AtomicU64,
    sink: RwLock<SharedSink>,
}

impl BackpressureQueue {
    /// Create a queue with the given capacity and configuration
    ///
    /// Capacity must be nonzero; the configuration is validated.
    pub fn new(capacity: usize, config: BackpressureConfig) -> EngineResult<Self> {
        if capacity == 0 {
            return Err(EngineError::InvalidArgument(
                "queue capacity must be nonzero".into(),
            ));
        }
        config.validate()?;

        let rate_limiter = if config.rate_limit.enabled {
            Some(Arc::new(TokenBucket::new(
                config.rate_limit.tokens_per_second,
                config.rate_limit.burst_size,
            )))
        } else {
            None
        };

        Ok(Self {
            capacity,
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            space_available: Condvar::new(),
            config: RwLock::new(config),
            rate_limiter: RwLock::new(rate_limiter),
            current_pressure: AtomicU8::new(level_to_u8(PressureLevel::None)),
            stats: BackpressureStats::default(),
            metrics: QueueMetrics::default(),
            avg_service_ns: AtomicU64::new(0),
            sink: RwLock::new(events::null_sink()),
        })
    }

    /// Queue with default backpressure configuration
    pub fn with_capacity(capacity: usize) -> EngineResult<Self> {
        Self::new(capacity, BackpressureConfig::default())
    }

    /// Install the event sink used for pressure and drop events
    pub fn set_event_sink(&self, sink: SharedSink) {
        *self.sink.write() = sink;
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Enqueue one job under the configured backpressure policy
    pub fn enqueue(&self, job: Job) -> VoidResult {
        let policy = self.config.read().policy;

        if let Err(err) = self.apply_rate_limit(1, policy) {
            self.reject(job.id(), &err);
            return Err(err);
        }

        self.enqueue_with_policy(job, policy)
    }

    /// Enqueue a batch of jobs
    ///
    /// All-or-nothing for `block` and `drop_newest`; `drop_oldest` discards
    /// as many queued jobs as needed; the `callback` policy consults the
    /// decision callback once for the whole batch.
    pub fn enqueue_batch(&self, mut jobs: Vec<Job>) -> VoidResult {
        if jobs.is_empty() {
            return Ok(());
        }
        let policy = self.config.read().policy;

        if let Err(err) = self.apply_rate_limit(jobs.len() as u64, policy) {
            for job in &jobs {
                self.reject(job.id(), &err);
            }
            return Err(err);
        }

        let needed = jobs.len();
        if needed > self.capacity && policy != BackpressurePolicy::DropOldest {
            let err = EngineError::QueueFull(format!(
                "batch of {needed} exceeds capacity {}",
                self.capacity
            ));
            for job in &jobs {
                self.reject(job.id(), &err);
            }
            return Err(err);
        }

        let mut inner = self.inner.lock();
        if inner.stopped {
            return Err(EngineError::QueueStopped);
        }

        match policy {
            BackpressurePolicy::Block => {
                let timeout = self.config.read().block_timeout;
                let started = Instant::now();
                let deadline = started + timeout;
                while self.capacity - inner.items.len() < needed && !inner.stopped {
                    if self.space_available.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                self.record_block_time(started.elapsed());
                if inner.stopped {
                    return Err(EngineError::QueueStopped);
                }
                if self.capacity - inner.items.len() < needed {
                    self.metrics.total_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(EngineError::OperationTimeout(format!(
                        "no room for batch of {needed} within {timeout:?}"
                    )));
                }
            }
            BackpressurePolicy::DropNewest => {
                if self.capacity - inner.items.len() < needed {
                    drop(inner);
                    let err = EngineError::QueueFull(format!(
                        "batch of {needed} rejected at capacity {}",
                        self.capacity
                    ));
                    for job in &jobs {
                        self.reject(job.id(), &err);
                    }
                    return Err(err);
                }
            }
            BackpressurePolicy::DropOldest => {
                while self.capacity.saturating_sub(inner.items.len()) < needed.min(self.capacity) {
                    if let Some(dropped) = inner.items.pop_front() {
                        self.drop_job(dropped.id());
                    } else {
                        break;
                    }
                }
                // A batch larger than the whole queue keeps only its newest
                // `capacity` jobs, mirroring the single-job semantics.
                if needed > self.capacity {
                    let excess = needed - self.capacity;
                    for dropped in jobs.drain(..excess) {
                        self.drop_job(dropped.id());
                    }
                }
            }
            BackpressurePolicy::Callback => {
                if self.capacity - inner.items.len() < needed {
                    drop(inner);
                    return self.apply_batch_decision(jobs);
                }
            }
            BackpressurePolicy::Adaptive => {
                if self.capacity - inner.items.len() < needed {
                    drop(inner);
                    return self.enqueue_batch_adaptive(jobs);
                }
            }
        }

        let count = jobs.len() as u64;
        for job in jobs {
            inner.items.push_back(job);
        }
        let depth = inner.items.len();
        self.stats.jobs_accepted.fetch_add(count, Ordering::Relaxed);
        self.metrics.total_enqueued.fetch_add(count, Ordering::Relaxed);
        self.metrics.observe_depth(depth);
        self.not_empty.notify_all();
        drop(inner);
        self.update_pressure(depth);
        Ok(())
    }

    fn enqueue_with_policy(&self, job: Job, policy: BackpressurePolicy) -> VoidResult {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return Err(EngineError::QueueStopped);
        }

        if inner.items.len() < self.capacity {
            return self.admit(inner, job);
        }

        match policy {
            BackpressurePolicy::Block => self.handle_block(inner, job),
            BackpressurePolicy::DropNewest => {
                drop(inner);
                let err = EngineError::QueueFull(format!("capacity {}", self.capacity));
                self.reject(job.id(), &err);
                Err(err)
            }
            BackpressurePolicy::DropOldest => self.handle_drop_oldest(inner, job),
            BackpressurePolicy::Callback => {
                drop(inner);
                self.handle_callback(job)
            }
            BackpressurePolicy::Adaptive => {
                let depth = inner.items.len();
                drop(inner);
                self.handle_adaptive(job, depth)
            }
        }
    }

    /// Push under the lock, then publish depth and pressure outside it
    fn admit(
        &self,
        mut inner: parking_lot::MutexGuard<'_, QueueInner>,
        job: Job,
    ) -> VoidResult {
        inner.items.push_back(job);
        let depth = inner.items.len();
        self.stats.jobs_accepted.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.metrics.observe_depth(depth);
        self.not_empty.notify_one();
        drop(inner);
        self.update_pressure(depth);
        Ok(())
    }

    fn handle_block(
        &self,
        mut inner: parking_lot::MutexGuard<'_, QueueInner>,
        job: Job,
    ) -> VoidResult {
        let timeout = self.config.read().block_timeout;
        let started = Instant::now();
        let deadline = started + timeout;

        while inner.items.len() >= self.capacity && !inner.stopped {
            if self.space_available.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        self.record_block_time(started.elapsed());

        if inner.stopped {
            return Err(EngineError::QueueStopped);
        }
        if inner.items.len() >= self.capacity {
            drop(inner);
            self.metrics.total_timeouts.fetch_add(1, Ordering::Relaxed);
            let err = EngineError::OperationTimeout(format!(
                "queue full for {timeout:?} at capacity {}",
                self.capacity
            ));
            self.reject(job.id(), &err);
            return Err(err);
        }
        self.admit(inner, job)
    }

    fn handle_drop_oldest(
        &self,
        mut inner: parking_lot::MutexGuard<'_, QueueInner>,
        job: Job,
    ) -> VoidResult {
        if let Some(dropped) = inner.items.pop_front() {
            self.drop_job(dropped.id());
        }
        self.admit(inner, job)
    }

    fn handle_callback(&self, job: Job) -> VoidResult {
        let callback = self.config.read().decision_callback.clone();
        let Some(callback) = callback else {
            let err = EngineError::InvalidArgument(
                "callback policy with no decision callback".into(),
            );
            self.reject(job.id(), &err);
            return Err(err);
        };

        match callback(&job) {
            BackpressureDecision::Accept => {
                let inner = self.inner.lock();
                if inner.stopped {
                    return Err(EngineError::QueueStopped);
                }
                if inner.items.len() < self.capacity {
                    self.admit(inner, job)
                } else {
                    // Growth beyond capacity is not permitted; fall back to
                    // rejection.
                    drop(inner);
                    let err = EngineError::QueueFull(format!("capacity {}", self.capacity));
                    self.reject(job.id(), &err);
                    Err(err)
                }
            }
            BackpressureDecision::Reject => {
                let err = EngineError::QueueFull("rejected by decision callback".into());
                self.reject(job.id(), &err);
                Err(err)
            }
            BackpressureDecision::DropAndAccept => {
                let inner = self.inner.lock();
                if inner.stopped {
                    return Err(EngineError::QueueStopped);
                }
                self.handle_drop_oldest(inner, job)
            }
            BackpressureDecision::Delay => {
                let interval = self.config.read().adaptive_sample_interval;
                std::thread::sleep(interval);
                let inner = self.inner.lock();
                if inner.stopped {
                    return Err(EngineError::QueueStopped);
                }
                if inner.items.len() < self.capacity {
                    self.admit(inner, job)
                } else {
                    drop(inner);
                    let err = EngineError::QueueFull("still full after delay".into());
                    self.reject(job.id(), &err);
                    Err(err)
                }
            }
        }
    }

    fn handle_adaptive(&self, job: Job, depth: usize) -> VoidResult {
        if self.estimated_wait(depth) > self.config.read().adaptive_target_latency {
            let err = EngineError::QueueFull(format!(
                "estimated wait above target at depth {depth}"
            ));
            self.reject(job.id(), &err);
            return Err(err);
        }

        // Under target: behave as block with a short bounded timeout.
        let interval = self.config.read().adaptive_sample_interval;
        let started = Instant::now();
        let deadline = started + interval;
        let mut inner = self.inner.lock();
        while inner.items.len() >= self.capacity && !inner.stopped {
            if self.space_available.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        self.record_block_time(started.elapsed());
        if inner.stopped {
            return Err(EngineError::QueueStopped);
        }
        if inner.items.len() >= self.capacity {
            drop(inner);
            self.metrics.total_timeouts.fetch_add(1, Ordering::Relaxed);
            let err = EngineError::OperationTimeout(format!(
                "adaptive wait exceeded {interval:?}"
            ));
            self.reject(job.id(), &err);
            return Err(err);
        }
        self.admit(inner, job)
    }

    fn apply_batch_decision(&self, jobs: Vec<Job>) -> VoidResult {
        let callback = self.config.read().decision_callback.clone();
        let Some(callback) = callback else {
            return Err(EngineError::InvalidArgument(
                "callback policy with no decision callback".into(),
            ));
        };
        let Some(first) = jobs.first() else {
            return Ok(());
        };

        match callback(first) {
            BackpressureDecision::Accept | BackpressureDecision::Delay => {
                let needed = jobs.len();
                let mut inner = self.inner.lock();
                if inner.stopped {
                    return Err(EngineError::QueueStopped);
                }
                if self.capacity - inner.items.len() < needed {
                    drop(inner);
                    let err = EngineError::QueueFull("batch rejected by capacity".into());
                    for job in &jobs {
                        self.reject(job.id(), &err);
                    }
                    return Err(err);
                }
                let count = jobs.len() as u64;
                for job in jobs {
                    inner.items.push_back(job);
                }
                let depth = inner.items.len();
                self.stats.jobs_accepted.fetch_add(count, Ordering::Relaxed);
                self.metrics.total_enqueued.fetch_add(count, Ordering::Relaxed);
                self.metrics.observe_depth(depth);
                self.not_empty.notify_all();
                drop(inner);
                self.update_pressure(depth);
                Ok(())
            }
            BackpressureDecision::Reject => {
                let err = EngineError::QueueFull("batch rejected by decision callback".into());
                for job in &jobs {
                    self.reject(job.id(), &err);
                }
                Err(err)
            }
            BackpressureDecision::DropAndAccept => {
                let needed = jobs.len();
                let mut inner = self.inner.lock();
                if inner.stopped {
                    return Err(EngineError::QueueStopped);
                }
                while self.capacity - inner.items.len() < needed {
                    match inner.items.pop_front() {
                        Some(dropped) => self.drop_job(dropped.id()),
                        None => break,
                    }
                }
                let count = jobs.len() as u64;
                for job in jobs {
                    inner.items.push_back(job);
                }
                let depth = inner.items.len();
                self.stats.jobs_accepted.fetch_add(count, Ordering::Relaxed);
                self.metrics.total_enqueued.fetch_add(count, Ordering::Relaxed);
                self.metrics.observe_depth(depth);
                self.not_empty.notify_all();
                drop(inner);
                self.update_pressure(depth);
                Ok(())
            }
        }
    }

    fn enqueue_batch_adaptive(&self, jobs: Vec<Job>) -> VoidResult {
        let depth = self.len();
        if self.estimated_wait(depth) > self.config.read().adaptive_target_latency {
            let err = EngineError::QueueFull(format!(
                "estimated wait above target at depth {depth}"
            ));
            for job in &jobs {
                self.reject(job.id(), &err);
            }
            return Err(err);
        }

        let needed = jobs.len();
        let interval = self.config.read().adaptive_sample_interval;
        let deadline = Instant::now() + interval;
        let mut inner = self.inner.lock();
        while self.capacity - inner.items.len() < needed && !inner.stopped {
            if self.space_available.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        if inner.stopped {
            return Err(EngineError::QueueStopped);
        }
        if self.capacity - inner.items.len() < needed {
            return Err(EngineError::OperationTimeout(format!(
                "adaptive batch wait exceeded {interval:?}"
            )));
        }
        let count = jobs.len() as u64;
        for job in jobs {
            inner.items.push_back(job);
        }
        let depth = inner.items.len();
        self.stats.jobs_accepted.fetch_add(count, Ordering::Relaxed);
        self.metrics.total_enqueued.fetch_add(count, Ordering::Relaxed);
        self.metrics.observe_depth(depth);
        self.not_empty.notify_all();
        drop(inner);
        self.update_pressure(depth);
        Ok(())
    }

    // =========================================================================
    // Dequeue
    // =========================================================================

    /// Non-blocking dequeue
    pub fn try_dequeue(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        let job = inner.items.pop_front()?;
        let depth = inner.items.len();
        self.metrics.total_dequeued.fetch_add(1, Ordering::Relaxed);
        self.space_available.notify_one();
        drop(inner);
        self.update_pressure(depth);
        Some(job)
    }

    /// Blocking dequeue; parks until a job arrives or the queue stops
    pub fn dequeue(&self) -> EngineResult<Job> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(job) = inner.items.pop_front() {
                let depth = inner.items.len();
                self.metrics.total_dequeued.fetch_add(1, Ordering::Relaxed);
                self.space_available.notify_one();
                drop(inner);
                self.update_pressure(depth);
                return Ok(job);
            }
            if inner.stopped {
                return Err(EngineError::QueueStopped);
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Blocking dequeue with a deadline
    pub fn dequeue_timeout(&self, timeout: Duration) -> EngineResult<Job> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(job) = inner.items.pop_front() {
                let depth = inner.items.len();
                self.metrics.total_dequeued.fetch_add(1, Ordering::Relaxed);
                self.space_available.notify_one();
                drop(inner);
                self.update_pressure(depth);
                return Ok(job);
            }
            if inner.stopped {
                return Err(EngineError::QueueStopped);
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                return if inner.stopped {
                    Err(EngineError::QueueStopped)
                } else {
                    Err(EngineError::OperationTimeout(format!(
                        "no job within {timeout:?}"
                    )))
                };
            }
        }
    }

    /// Drain up to `max` jobs without blocking, preserving FIFO order
    pub fn dequeue_batch(&self, max: usize) -> Vec<Job> {
        let mut inner = self.inner.lock();
        let count = max.min(inner.items.len());
        let batch: Vec<Job> = inner.items.drain(..count).collect();
        if !batch.is_empty() {
            let depth = inner.items.len();
            self.metrics
                .total_dequeued
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.space_available.notify_all();
            drop(inner);
            self.update_pressure(depth);
        }
        batch
    }

    // =========================================================================
    // Lifecycle and queries
    // =========================================================================

    /// Permanently stop the queue: wake all waiters, fail further enqueues
    ///
    /// Remaining jobs stay dequeueable; once drained, dequeues return
    /// `queue_stopped`.
    pub fn stop_waiting_dequeue(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        self.not_empty.notify_all();
        self.space_available.notify_all();
    }

    /// Whether the queue has been stopped
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Discard all queued jobs
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        self.space_available.notify_all();
        drop(inner);
        self.update_pressure(0);
    }

    /// Current depth
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current pressure level (lock-free read)
    pub fn pressure_level(&self) -> PressureLevel {
        level_from_u8(self.current_pressure.load(Ordering::Acquire))
    }

    /// Current depth as a ratio of capacity
    pub fn pressure_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Whether the rate limiter is currently out of tokens
    pub fn is_rate_limited(&self) -> bool {
        self.rate_limiter
            .read()
            .as_ref()
            .map(|bucket| bucket.available_tokens() == 0)
            .unwrap_or(false)
    }

    /// Available rate-limit tokens, or `u64::MAX` when disabled
    pub fn available_tokens(&self) -> u64 {
        self.rate_limiter
            .read()
            .as_ref()
            .map(|bucket| bucket.available_tokens())
            .unwrap_or(u64::MAX)
    }

    /// Apply a new backpressure configuration
    ///
    /// The token bucket is recreated when rate-limit parameters change.
    pub fn set_backpressure_config(&self, config: BackpressureConfig) -> EngineResult<()> {
        config.validate()?;

        {
            let mut limiter = self.rate_limiter.write();
            let current = self.config.read();
            let params_changed = current.rate_limit.enabled != config.rate_limit.enabled
                || current.rate_limit.tokens_per_second != config.rate_limit.tokens_per_second
                || current.rate_limit.burst_size != config.rate_limit.burst_size;
            drop(current);

            if params_changed {
                *limiter = if config.rate_limit.enabled {
                    Some(Arc::new(TokenBucket::new(
                        config.rate_limit.tokens_per_second,
                        config.rate_limit.burst_size,
                    )))
                } else {
                    None
                };
            }
        }

        *self.config.write() = config;
        Ok(())
    }

    /// Backpressure statistics snapshot
    pub fn stats(&self) -> BackpressureStatsSnapshot {
        self.stats.snapshot()
    }

    /// Queue health metrics snapshot
    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Reset backpressure statistics
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Feed one observed service time into the adaptive estimator (EWMA 1/8)
    pub fn record_service_time(&self, elapsed: Duration) {
        let sample = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        let _ = self
            .avg_service_ns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avg| {
                if avg == 0 {
                    Some(sample)
                } else {
                    Some(avg - avg / 8 + sample / 8)
                }
            });
    }

    /// Average observed service time
    pub fn avg_service_time(&self) -> Duration {
        Duration::from_nanos(self.avg_service_ns.load(Ordering::Acquire))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn apply_rate_limit(&self, tokens: u64, policy: BackpressurePolicy) -> VoidResult {
        let limiter = self.rate_limiter.read().clone();
        let Some(bucket) = limiter else {
            return Ok(());
        };

        if bucket.try_acquire(tokens) {
            return Ok(());
        }

        if policy == BackpressurePolicy::Block {
            let timeout = self.config.read().block_timeout;
            let started = Instant::now();
            self.stats.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
            let acquired = bucket.try_acquire_for(tokens, timeout);
            self.record_block_time(started.elapsed());
            if acquired {
                return Ok(());
            }
            return Err(EngineError::RateLimited(format!(
                "no token within {timeout:?}"
            )));
        }

        Err(EngineError::RateLimited(format!(
            "{tokens} token(s) unavailable"
        )))
    }

    fn estimated_wait(&self, depth: usize) -> Duration {
        let config = self.config.read();
        let avg = self.avg_service_time();
        match config.adaptive_wait_estimator.as_ref() {
            Some(estimator) => estimator(depth, avg),
            None => avg.saturating_mul(depth as u32),
        }
    }

    fn record_block_time(&self, elapsed: Duration) {
        self.stats
            .total_block_time_ns
            .fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    fn reject(&self, job_id: u64, err: &EngineError) {
        self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
        self.metrics.total_rejected.fetch_add(1, Ordering::Relaxed);
        let sink = self.sink.read().clone();
        events::emit(
            &sink,
            EngineEvent::JobRejected {
                job_id,
                reason: err.kind().to_string(),
            },
        );
    }

    fn drop_job(&self, job_id: u64) {
        self.stats.jobs_dropped.fetch_add(1, Ordering::Relaxed);
        let sink = self.sink.read().clone();
        events::emit(
            &sink,
            EngineEvent::JobDropped {
                job_id,
                reason: "drop_oldest".to_string(),
            },
        );
    }

    /// Recompute the pressure level with hysteresis and publish transitions
    fn update_pressure(&self, depth: usize) {
        let (low, high) = {
            let config = self.config.read();
            (config.low_watermark, config.high_watermark)
        };
        let low_mark = (low * self.capacity as f64) as usize;
        let high_mark = (high * self.capacity as f64).ceil() as usize;

        loop {
            let current = level_from_u8(self.current_pressure.load(Ordering::Acquire));
            let new = match current {
                PressureLevel::None | PressureLevel::Low => {
                    if depth >= self.capacity {
                        PressureLevel::Critical
                    } else if depth >= high_mark {
                        PressureLevel::High
                    } else if depth >= low_mark {
                        PressureLevel::Low
                    } else {
                        PressureLevel::None
                    }
                }
                PressureLevel::High | PressureLevel::Critical => {
                    if depth >= self.capacity {
                        PressureLevel::Critical
                    } else if depth >= high_mark {
                        PressureLevel::High
                    } else if depth < low_mark {
                        // Falls back only below the low watermark.
                        PressureLevel::Low
                    } else {
                        PressureLevel::High
                    }
                }
            };

            if new == current {
                return;
            }
            if self
                .current_pressure
                .compare_exchange(
                    level_to_u8(current),
                    level_to_u8(new),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            let rising = level_to_u8(new) > level_to_u8(current);
            if rising
                && matches!(new, PressureLevel::High | PressureLevel::Critical)
            {
                self.stats.pressure_events.fetch_add(1, Ordering::Relaxed);
            }

            let ratio = depth as f64 / self.capacity as f64;
            trace!(
                old = current.as_str(),
                new = new.as_str(),
                depth,
                "pressure transition"
            );
            if let Some(callback) = self.config.read().pressure_callback.clone() {
                callback(depth, ratio);
            }
            let sink = self.sink.read().clone();
            events::emit(
                &sink,
                EngineEvent::PressureChanged {
                    level: new,
                    depth,
                    ratio,
                },
            );
            return;
        }
    }
}

impl std::fmt::Debug for BackpressureQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureQueue")
            .field("capacity", &self.capacity)
            .field("depth", &self.len())
            .field("pressure", &self.pressure_level())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
