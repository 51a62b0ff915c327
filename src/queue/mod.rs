//! Job queues: backpressure-aware bounded FIFO and a lock-free variant
//!
//! The crate exposes one queue abstraction, [`JobQueue`], with capability
//! queries instead of a family of concrete queue types. Callers that need a
//! particular mix of capabilities describe them in a [`QueueRequirements`]
//! and let [`queue_factory`] pick the cheapest implementation that satisfies
//! the set.

pub mod backpressure;
pub mod config;
pub mod segmented;
pub mod token_bucket;

pub use backpressure::BackpressureQueue;
pub use config::{
    BackpressureConfig, BackpressureDecision, BackpressurePolicy, BackpressureStats,
    BackpressureStatsSnapshot, PressureLevel, QueueMetricsSnapshot, RateLimitConfig,
};
pub use segmented::SegmentedQueue;
pub use token_bucket::TokenBucket;

use std::sync::Arc;

use crate::error::{EngineError, EngineResult, VoidResult};
use crate::job::Job;

/// Common contract over queue implementations, with capability queries
///
/// Implementations differ in what they can promise (bounded capacity,
/// blocking admission, overflow shedding, lock freedom); the capability
/// methods let generic code check before relying on a behavior.
pub trait JobQueue: Send + Sync {
    /// Admit one job
    fn enqueue(&self, job: Job) -> VoidResult;

    /// Admit a batch of jobs
    fn enqueue_batch(&self, jobs: Vec<Job>) -> VoidResult;

    /// Non-blocking dequeue
    fn try_dequeue(&self) -> Option<Job>;

    /// Drain up to `max` jobs without blocking
    fn dequeue_batch(&self, max: usize) -> Vec<Job>;

    /// Permanently stop the queue and wake all waiters
    fn stop(&self);

    /// Whether the queue has been stopped
    fn is_stopped(&self) -> bool;

    /// Discard all queued jobs
    fn clear(&self);

    /// Current depth
    fn len(&self) -> usize;

    /// Whether the queue is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bound on depth, if any
    fn capacity(&self) -> Option<usize>;

    /// Whether producers can park until space is available
    fn can_block(&self) -> bool;

    /// Whether the queue can shed its oldest entries under overflow
    fn can_drop_oldest(&self) -> bool;

    /// Whether enqueue is lock-free
    fn is_lock_free(&self) -> bool;
}

impl JobQueue for BackpressureQueue {
    fn enqueue(&self, job: Job) -> VoidResult {
        BackpressureQueue::enqueue(self, job)
    }

    fn enqueue_batch(&self, jobs: Vec<Job>) -> VoidResult {
        BackpressureQueue::enqueue_batch(self, jobs)
    }

    fn try_dequeue(&self) -> Option<Job> {
        BackpressureQueue::try_dequeue(self)
    }

    fn dequeue_batch(&self, max: usize) -> Vec<Job> {
        BackpressureQueue::dequeue_batch(self, max)
    }

    fn stop(&self) {
        self.stop_waiting_dequeue();
    }

    fn is_stopped(&self) -> bool {
        BackpressureQueue::is_stopped(self)
    }

    fn clear(&self) {
        BackpressureQueue::clear(self)
    }

    fn len(&self) -> usize {
        BackpressureQueue::len(self)
    }

    fn capacity(&self) -> Option<usize> {
        Some(BackpressureQueue::capacity(self))
    }

    fn can_block(&self) -> bool {
        true
    }

    fn can_drop_oldest(&self) -> bool {
        true
    }

    fn is_lock_free(&self) -> bool {
        false
    }
}

impl JobQueue for SegmentedQueue {
    fn enqueue(&self, job: Job) -> VoidResult {
        SegmentedQueue::enqueue(self, job)
    }

    fn enqueue_batch(&self, jobs: Vec<Job>) -> VoidResult {
        SegmentedQueue::enqueue_batch(self, jobs)
    }

    fn try_dequeue(&self) -> Option<Job> {
        SegmentedQueue::try_dequeue(self)
    }

    fn dequeue_batch(&self, max: usize) -> Vec<Job> {
        SegmentedQueue::dequeue_batch(self, max)
    }

    fn stop(&self) {
        SegmentedQueue::stop(self);
    }

    fn is_stopped(&self) -> bool {
        SegmentedQueue::is_stopped(self)
    }

    fn clear(&self) {
        SegmentedQueue::clear(self)
    }

    fn len(&self) -> usize {
        SegmentedQueue::len(self)
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn can_block(&self) -> bool {
        false
    }

    fn can_drop_oldest(&self) -> bool {
        false
    }

    fn is_lock_free(&self) -> bool {
        true
    }
}

/// Capability requirements handed to [`queue_factory`]
#[derive(Debug, Clone, Default)]
pub struct QueueRequirements {
    /// Depth bound; `None` means unbounded is acceptable
    pub bounded_capacity: Option<usize>,
    /// Producers must be able to park for space
    pub blocking_producers: bool,
    /// Overflow must shed the oldest entries
    pub drop_oldest: bool,
    /// Enqueue must be lock-free
    pub lock_free: bool,
    /// Backpressure configuration applied when a bounded queue is selected
    pub backpressure: Option<BackpressureConfig>,
}

/// Select a queue implementation satisfying the requirement set
///
/// Lock-free admission is incompatible with bounds, blocking, and shedding;
/// asking for both fails with `invalid_argument`. A plain requirement set
/// (nothing asked for) yields the lock-free queue, the cheapest one on the
/// enqueue path.
pub fn queue_factory(requirements: QueueRequirements) -> EngineResult<Arc<dyn JobQueue>> {
    let needs_bound = requirements.bounded_capacity.is_some()
        || requirements.blocking_producers
        || requirements.drop_oldest
        || requirements.backpressure.is_some();

    if requirements.lock_free && needs_bound {
        return Err(EngineError::InvalidArgument(
            "lock-free admission cannot be combined with bounded/blocking/shedding \
             requirements"
                .into(),
        ));
    }

    if !needs_bound {
        return Ok(Arc::new(SegmentedQueue::new()));
    }

    let capacity = requirements.bounded_capacity.unwrap_or(10_000);
    let mut config = requirements.backpressure.unwrap_or_default();
    if requirements.drop_oldest {
        config.policy = BackpressurePolicy::DropOldest;
    } else if requirements.blocking_producers {
        config.policy = BackpressurePolicy::Block;
    }
    Ok(Arc::new(BackpressureQueue::new(capacity, config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_defaults_to_lock_free() {
        let queue = queue_factory(QueueRequirements::default()).unwrap();
        assert!(queue.is_lock_free());
        assert_eq!(queue.capacity(), None);
    }

    #[test]
    fn test_factory_bounded_blocking() {
        let queue = queue_factory(QueueRequirements {
            bounded_capacity: Some(64),
            blocking_producers: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(queue.capacity(), Some(64));
        assert!(queue.can_block());
        assert!(!queue.is_lock_free());
    }

    #[test]
    fn test_factory_rejects_contradictions() {
        let result = queue_factory(QueueRequirements {
            lock_free: true,
            bounded_capacity: Some(8),
            ..Default::default()
        });
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn test_trait_object_round_trip() {
        let queue = queue_factory(QueueRequirements {
            bounded_capacity: Some(4),
            ..Default::default()
        })
        .unwrap();

        queue
            .enqueue(Job::new("a", Box::new(|| Ok(()))))
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_dequeue().unwrap().name(), "a");
        assert!(queue.is_empty());
    }
}
