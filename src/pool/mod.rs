//! Worker pool
//!
//! Owns N worker threads, a shared backpressure queue, an ordered policy
//! list, and (when stealing is enabled) one Chase-Lev deque per worker.
//! Lifecycle is `created → running → stopped`, stopped being terminal; a
//! graceful stop drains queued work up to `shutdown_timeout`, an immediate
//! stop discards it.

pub mod policy;
pub mod watchdog;
mod worker;

pub use policy::{AutoscalePolicy, CircuitBreakerPolicy, PoolPolicy, ScaleHint, ScaleHintFn};
pub use watchdog::{DeadlineHandle, TimeoutWatchdog};

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::deque::{Stealer, Worker as WorkerDeque};
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult, VoidResult};
use crate::events::{self, EngineEvent, SharedSink};
use crate::job::Job;
use crate::queue::{BackpressureConfig, BackpressureQueue};
use crate::stealing::{DepthBoard, WorkStealingConfig, WorkStealingStats, WorkStealingStatsSnapshot};

/// Pool configuration
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of worker threads; zero is allowed (the pool then only queues)
    pub worker_count: usize,
    /// Shared queue capacity
    pub queue_capacity: usize,
    /// Backpressure settings for the shared queue
    pub backpressure: BackpressureConfig,
    /// How long idle workers park before re-checking for work
    pub wake_interval: Duration,
    /// Budget for draining the queue during a graceful stop
    pub shutdown_timeout: Duration,
    /// Work-stealing settings
    pub stealing: WorkStealingConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            queue_capacity: 10_000,
            backpressure: BackpressureConfig::default(),
            wake_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            stealing: WorkStealingConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Validate pool-level settings (queue settings validate separately)
    pub fn validate(&self) -> EngineResult<()> {
        if self.wake_interval.is_zero() {
            return Err(EngineError::InvalidArgument(
                "wake_interval must be nonzero".into(),
            ));
        }
        if self.stealing.enabled && self.stealing.max_steal_batch == 0 {
            return Err(EngineError::InvalidArgument(
                "max_steal_batch must be nonzero".into(),
            ));
        }
        self.backpressure.validate()
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("worker_count", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .field("wake_interval", &self.wake_interval)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("stealing", &self.stealing)
            .finish()
    }
}

/// Per-pool execution counters
#[derive(Debug, Default)]
pub struct PoolStats {
    pub(crate) jobs_executed: AtomicU64,
    pub(crate) jobs_failed: AtomicU64,
    pub(crate) jobs_cancelled: AtomicU64,
    pub(crate) jobs_retried: AtomicU64,
}

/// Copyable snapshot of [`PoolStats`]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolStatsSnapshot {
    /// Jobs that ran and succeeded
    pub jobs_executed: u64,
    /// Failed execution attempts
    pub jobs_failed: u64,
    /// Jobs skipped or finished as cancelled
    pub jobs_cancelled: u64,
    /// Failed attempts re-enqueued by a retry policy
    pub jobs_retried: u64,
}

impl PoolStats {
    fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
        }
    }
}

const LIFECYCLE_CREATED: u8 = 0;
const LIFECYCLE_RUNNING: u8 = 1;
const LIFECYCLE_STOPPED: u8 = 2;

pub(crate) const SHUTDOWN_NONE: u8 = 0;
pub(crate) const SHUTDOWN_GRACEFUL: u8 = 1;
pub(crate) const SHUTDOWN_IMMEDIATE: u8 = 2;

pub(crate) struct PoolInner {
    pub(crate) name: String,
    pub(crate) config: PoolConfig,
    pub(crate) queue: Arc<BackpressureQueue>,
    pub(crate) policies: RwLock<Vec<Arc<dyn PoolPolicy>>>,
    pub(crate) lifecycle: AtomicU8,
    pub(crate) shutdown: AtomicU8,
    pub(crate) inboxes: Vec<SegQueue<Job>>,
    pub(crate) depth_board: DepthBoard,
    pub(crate) steal_stats: WorkStealingStats,
    pub(crate) stats: PoolStats,
    pub(crate) watchdog: TimeoutWatchdog,
    pub(crate) sink: RwLock<SharedSink>,
}

impl PoolInner {
    pub(crate) fn shutdown_state(&self) -> u8 {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn policies_snapshot(&self) -> Vec<Arc<dyn PoolPolicy>> {
        self.policies.read().clone()
    }

    pub(crate) fn sink(&self) -> SharedSink {
        self.sink.read().clone()
    }
}

/// Concurrent job executor with backpressure, policies, and work stealing
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool with the given name and configuration
    pub fn new(name: impl Into<String>, config: PoolConfig) -> EngineResult<Self> {
        config.validate()?;
        let queue = Arc::new(BackpressureQueue::new(
            config.queue_capacity,
            config.backpressure.clone(),
        )?);
        let worker_count = config.worker_count;

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                queue,
                policies: RwLock::new(Vec::new()),
                lifecycle: AtomicU8::new(LIFECYCLE_CREATED),
                shutdown: AtomicU8::new(SHUTDOWN_NONE),
                inboxes: (0..worker_count).map(|_| SegQueue::new()).collect(),
                depth_board: DepthBoard::new(worker_count),
                steal_stats: WorkStealingStats::default(),
                stats: PoolStats::default(),
                watchdog: TimeoutWatchdog::new(),
                sink: RwLock::new(events::null_sink()),
                config,
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Pool with default configuration
    pub fn with_workers(name: impl Into<String>, worker_count: usize) -> EngineResult<Self> {
        Self::new(
            name,
            PoolConfig {
                worker_count,
                ..Default::default()
            },
        )
    }

    /// Install the event sink used by the pool and its queue
    pub fn set_event_sink(&self, sink: SharedSink) {
        *self.inner.sink.write() = sink.clone();
        self.inner.queue.set_event_sink(sink);
    }

    /// Append a policy to the ordered policy list
    pub fn add_policy(&self, policy: Arc<dyn PoolPolicy>) {
        debug!(pool = %self.inner.name, policy = policy.name(), "policy added");
        self.inner.policies.write().push(policy);
    }

    /// Start the worker threads
    ///
    /// Fails with `already_running` on a second call and with
    /// `thread_start_failure` once the pool has been stopped (stopped is
    /// terminal) or when thread creation fails.
    pub fn start(&self) -> VoidResult {
        match self.inner.lifecycle.compare_exchange(
            LIFECYCLE_CREATED,
            LIFECYCLE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(LIFECYCLE_RUNNING) => {
                return Err(EngineError::AlreadyRunning(format!(
                    "pool '{}' is already running",
                    self.inner.name
                )));
            }
            Err(_) => {
                return Err(EngineError::ThreadStartFailure(format!(
                    "pool '{}' has been stopped",
                    self.inner.name
                )));
            }
        }

        self.inner.shutdown.store(SHUTDOWN_NONE, Ordering::Release);
        self.inner.watchdog.start(&self.inner.name);

        let worker_count = self.inner.config.worker_count;
        let stealing = self.inner.config.stealing.enabled && worker_count > 0;

        // Deques are created up front so every worker can hold every
        // stealer; each deque is then moved into its owner thread.
        let mut deques: Vec<Option<WorkerDeque<Job>>> = Vec::with_capacity(worker_count);
        let mut stealers: Vec<Stealer<Job>> = Vec::with_capacity(worker_count);
        if stealing {
            for _ in 0..worker_count {
                let deque = WorkerDeque::new_lifo();
                stealers.push(deque.stealer());
                deques.push(Some(deque));
            }
        } else {
            deques.resize_with(worker_count, || None);
        }
        let stealers = Arc::new(stealers);

        let mut handles = self.handles.lock();
        for (id, local) in deques.into_iter().enumerate() {
            let context = worker::WorkerContext {
                id,
                inner: self.inner.clone(),
                local,
                stealers: stealers.clone(),
            };
            let thread = std::thread::Builder::new()
                .name(format!("{}-worker-{id}", self.inner.name))
                .spawn(move || worker::run(context));
            match thread {
                Ok(thread) => handles.push(thread),
                Err(err) => {
                    // Roll back: stop whatever already started.
                    self.inner
                        .shutdown
                        .store(SHUTDOWN_IMMEDIATE, Ordering::Release);
                    self.inner.queue.stop_waiting_dequeue();
                    for handle in handles.drain(..) {
                        let _ = handle.join();
                    }
                    self.inner
                        .lifecycle
                        .store(LIFECYCLE_STOPPED, Ordering::Release);
                    self.inner.watchdog.stop();
                    return Err(EngineError::ThreadStartFailure(format!(
                        "worker {id}: {err}"
                    )));
                }
            }
        }

        info!(
            pool = %self.inner.name,
            workers = worker_count,
            stealing,
            "pool started"
        );
        Ok(())
    }

    /// Stop the pool
    ///
    /// A graceful stop (`immediate == false`) lets workers drain the queue
    /// for up to `shutdown_timeout` before escalating; an immediate stop
    /// discards pending jobs. Stopped is terminal.
    pub fn stop(&self, immediate: bool) -> VoidResult {
        match self.inner.lifecycle.compare_exchange(
            LIFECYCLE_RUNNING,
            LIFECYCLE_STOPPED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(_) => {
                return Err(EngineError::NotRunning(format!(
                    "pool '{}' is not running",
                    self.inner.name
                )));
            }
        }

        if immediate {
            self.inner
                .shutdown
                .store(SHUTDOWN_IMMEDIATE, Ordering::Release);
            self.inner.queue.stop_waiting_dequeue();
            self.inner.queue.clear();
            self.drain_inboxes();
        } else {
            self.inner
                .shutdown
                .store(SHUTDOWN_GRACEFUL, Ordering::Release);
        }

        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        let mut handles = self.handles.lock();

        if !immediate {
            // Give workers the drain window, then escalate.
            while Instant::now() < deadline {
                if handles.iter().all(JoinHandle::is_finished) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            if !handles.iter().all(JoinHandle::is_finished) {
                warn!(
                    pool = %self.inner.name,
                    "graceful drain exceeded shutdown timeout, discarding pending jobs"
                );
                self.inner
                    .shutdown
                    .store(SHUTDOWN_IMMEDIATE, Ordering::Release);
                self.inner.queue.stop_waiting_dequeue();
                self.inner.queue.clear();
                self.drain_inboxes();
            } else {
                self.inner.queue.stop_waiting_dequeue();
            }
        }

        let mut join_error = None;
        for handle in handles.drain(..) {
            if handle.join().is_err() {
                join_error = Some(EngineError::ThreadJoinFailure(
                    "worker thread panicked outside the job boundary".into(),
                ));
            }
        }
        drop(handles);

        self.inner.queue.stop_waiting_dequeue();
        self.inner.watchdog.stop();
        info!(pool = %self.inner.name, immediate, "pool stopped");

        match join_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Submit a job through the policy chain into the shared queue
    pub fn submit(&self, job: Job) -> VoidResult {
        for policy in self.inner.policies_snapshot() {
            if let Err(err) = policy.on_enqueue(&job) {
                events::emit(
                    &self.inner.sink(),
                    EngineEvent::JobRejected {
                        job_id: job.id(),
                        reason: err.kind().to_string(),
                    },
                );
                return Err(err);
            }
        }
        self.inner.queue.enqueue(job)
    }

    /// Submit a batch; any policy rejection fails the whole batch
    pub fn submit_batch(&self, jobs: Vec<Job>) -> VoidResult {
        for job in &jobs {
            for policy in self.inner.policies_snapshot() {
                if let Err(err) = policy.on_enqueue(job) {
                    events::emit(
                        &self.inner.sink(),
                        EngineEvent::JobRejected {
                            job_id: job.id(),
                            reason: err.kind().to_string(),
                        },
                    );
                    return Err(err);
                }
            }
        }
        self.inner.queue.enqueue_batch(jobs)
    }

    /// Place a job directly in one worker's hand-off inbox
    ///
    /// Bypasses the shared queue (policies still apply); the target worker
    /// drains its inbox into its local deque, making the job stealable by
    /// peers. Intended for placement-sensitive and load-skewed workloads.
    pub fn submit_local(&self, job: Job, worker: usize) -> VoidResult {
        if worker >= self.inner.config.worker_count {
            return Err(EngineError::InvalidArgument(format!(
                "worker index {worker} out of range 0..{}",
                self.inner.config.worker_count
            )));
        }
        if self.inner.lifecycle.load(Ordering::Acquire) == LIFECYCLE_STOPPED {
            return Err(EngineError::QueueStopped);
        }
        for policy in self.inner.policies_snapshot() {
            policy.on_enqueue(&job)?;
        }
        self.inner.inboxes[worker].push(job);
        Ok(())
    }

    /// Jobs waiting anywhere in the pool (queue, inboxes, local deques)
    pub fn pending(&self) -> usize {
        let inboxed: usize = self.inner.inboxes.iter().map(SegQueue::len).sum();
        let local: usize = (0..self.inner.config.worker_count)
            .map(|w| self.inner.depth_board.read(w))
            .sum();
        self.inner.queue.len() + inboxed + local
    }

    /// Whether the pool is running
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) == LIFECYCLE_RUNNING
    }

    /// Configured worker count
    pub fn worker_count(&self) -> usize {
        self.inner.config.worker_count
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The shared backpressure queue
    pub fn queue(&self) -> &Arc<BackpressureQueue> {
        &self.inner.queue
    }

    /// Execution counters
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Work-stealing counters
    pub fn steal_stats(&self) -> WorkStealingStatsSnapshot {
        self.inner.steal_stats.snapshot()
    }

    fn drain_inboxes(&self) {
        for inbox in &self.inner.inboxes {
            while inbox.pop().is_some() {}
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.config.worker_count)
            .field("running", &self.is_running())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = counter.clone();
        Job::new(
            "count",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
    }

    fn small_pool(workers: usize) -> WorkerPool {
        WorkerPool::new(
            "test",
            PoolConfig {
                worker_count: workers,
                queue_capacity: 128,
                wake_interval: Duration::from_millis(10),
                shutdown_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let pool = small_pool(2);
        assert!(!pool.is_running());
        pool.start().unwrap();
        assert!(pool.is_running());

        assert!(matches!(
            pool.start(),
            Err(EngineError::AlreadyRunning(_))
        ));

        pool.stop(false).unwrap();
        assert!(!pool.is_running());
        assert!(matches!(pool.stop(false), Err(EngineError::NotRunning(_))));
        assert!(matches!(
            pool.start(),
            Err(EngineError::ThreadStartFailure(_))
        ));
    }

    #[test]
    fn test_jobs_execute() {
        let pool = small_pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        pool.start().unwrap();

        for _ in 0..20 {
            pool.submit(counting_job(&counter)).unwrap();
        }
        pool.stop(false).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(pool.stats().jobs_executed, 20);
    }

    #[test]
    fn test_zero_worker_pool_starts_and_stops() {
        let pool = small_pool(0);
        let counter = Arc::new(AtomicUsize::new(0));
        pool.start().unwrap();
        pool.submit(counting_job(&counter)).unwrap();
        pool.stop(true).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_immediate_stop_discards_pending() {
        let pool = small_pool(0);
        let counter = Arc::new(AtomicUsize::new(0));
        pool.start().unwrap();
        for _ in 0..5 {
            pool.submit(counting_job(&counter)).unwrap();
        }
        assert_eq!(pool.pending(), 5);
        pool.stop(true).unwrap();
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let pool = small_pool(1);
        pool.start().unwrap();
        pool.stop(false).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            pool.submit(counting_job(&counter)),
            Err(EngineError::QueueStopped)
        ));
    }

    #[test]
    fn test_submit_before_start_runs_after_start() {
        let pool = small_pool(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            pool.submit(counting_job(&counter)).unwrap();
        }
        pool.start().unwrap();
        pool.stop(false).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_submit_local_bounds_checked() {
        let pool = small_pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            pool.submit_local(counting_job(&counter), 7),
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
