//! Lock-free queue variant for the enqueue hot path
//!
//! An unbounded MPMC queue built on `crossbeam::queue::SegQueue`. It trades
//! the backpressure feature set (capacity, watermarks, blocking, overflow
//! policies) for wait-free producers, and is what the factory hands out when
//! the caller's requirement set asks for lock-free admission and nothing
//! that needs a bound.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::SegQueue;

use crate::error::{EngineError, EngineResult, VoidResult};
use crate::job::Job;
use crate::queue::config::{QueueMetrics, QueueMetricsSnapshot};

/// Unbounded lock-free FIFO queue
pub struct SegmentedQueue {
    items: SegQueue<Job>,
    stopped: AtomicBool,
    metrics: QueueMetrics,
}

impl SegmentedQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: SegQueue::new(),
            stopped: AtomicBool::new(false),
            metrics: QueueMetrics::default(),
        }
    }

    /// Enqueue without blocking; fails only when stopped
    pub fn enqueue(&self, job: Job) -> VoidResult {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::QueueStopped);
        }
        self.items.push(job);
        self.metrics.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.metrics.observe_depth(self.items.len());
        Ok(())
    }

    /// Enqueue a batch; fails only when stopped
    pub fn enqueue_batch(&self, jobs: Vec<Job>) -> VoidResult {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::QueueStopped);
        }
        let count = jobs.len() as u64;
        for job in jobs {
            self.items.push(job);
        }
        self.metrics.total_enqueued.fetch_add(count, Ordering::Relaxed);
        self.metrics.observe_depth(self.items.len());
        Ok(())
    }

    /// Non-blocking dequeue
    pub fn try_dequeue(&self) -> Option<Job> {
        let job = self.items.pop()?;
        self.metrics.total_dequeued.fetch_add(1, Ordering::Relaxed);
        Some(job)
    }

    /// Non-blocking dequeue with the stopped state surfaced
    pub fn dequeue(&self) -> EngineResult<Job> {
        match self.try_dequeue() {
            Some(job) => Ok(job),
            None if self.stopped.load(Ordering::Acquire) => Err(EngineError::QueueStopped),
            None => Err(EngineError::QueueEmpty),
        }
    }

    /// Drain up to `max` jobs, preserving FIFO order
    pub fn dequeue_batch(&self, max: usize) -> Vec<Job> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.items.pop() {
                Some(job) => batch.push(job),
                None => break,
            }
        }
        self.metrics
            .total_dequeued
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Permanently stop the queue
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Whether the queue has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Discard all queued jobs
    pub fn clear(&self) {
        while self.items.pop().is_some() {}
    }

    /// Current depth (approximate under concurrency)
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queue health metrics snapshot
    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for SegmentedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SegmentedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedQueue")
            .field("depth", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
