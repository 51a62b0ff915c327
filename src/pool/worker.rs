//! Worker thread loop
//!
//! Each worker looks for work in a fixed order: its own local deque (LIFO),
//! its hand-off inbox, the shared queue, then peers' deques via stealing.
//! Finding nothing, it parks on the shared queue for one wake interval.
//! Graceful shutdown lets a worker exit once no work remains anywhere it
//! can see; immediate shutdown exits at the next loop head.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crossbeam::deque::{Steal, Stealer, Worker as WorkerDeque};
use tracing::{debug, trace, warn};

use crate::error::EngineError;
use crate::events::{self, EngineEvent};
use crate::job::Job;
use crate::pool::{PoolInner, SHUTDOWN_GRACEFUL, SHUTDOWN_IMMEDIATE, SHUTDOWN_NONE};
use crate::stealing::{steal_batch_size, StealBackoff, VictimSelector};

pub(crate) struct WorkerContext {
    pub(crate) id: usize,
    pub(crate) inner: Arc<PoolInner>,
    pub(crate) local: Option<WorkerDeque<Job>>,
    pub(crate) stealers: Arc<Vec<Stealer<Job>>>,
}

pub(crate) fn run(context: WorkerContext) {
    let inner = context.inner.clone();
    events::emit(
        &inner.sink(),
        EngineEvent::WorkerStarted {
            worker_id: context.id,
        },
    );

    let stealing = context.local.is_some();
    let config = inner.config.stealing.clone();
    let mut selector = VictimSelector::new(
        config.victim_selection,
        context.id,
        inner.config.worker_count,
        config.topology.clone(),
    );
    let mut backoff = StealBackoff::new(&config);

    loop {
        match inner.shutdown_state() {
            SHUTDOWN_IMMEDIATE => break,
            SHUTDOWN_GRACEFUL => {
                if !has_visible_work(&context) {
                    break;
                }
            }
            _ => {}
        }

        // 1. Local deque, newest first.
        if let Some(job) = context.local.as_ref().and_then(WorkerDeque::pop) {
            publish_depth(&context);
            execute_job(&context, job);
            continue;
        }

        // 2. Hand-off inbox; drained into the local deque so peers can
        // steal the overflow.
        if let Some(job) = take_from_inbox(&context) {
            execute_job(&context, job);
            continue;
        }

        // 3. Shared queue. With stealing enabled, fetch a batch and keep
        // the overflow locally.
        if let Some(job) = take_from_queue(&context, stealing) {
            execute_job(&context, job);
            continue;
        }

        // 4. Steal from peers.
        if stealing {
            if let Some(job) = try_steal(&context, &mut selector) {
                backoff.reset();
                execute_job(&context, job);
                continue;
            }
            std::thread::sleep(backoff.next_delay());
        }

        // 5. Park on the shared queue for one wake interval.
        match inner.queue.dequeue_timeout(inner.config.wake_interval) {
            Ok(job) => execute_job(&context, job),
            Err(EngineError::QueueStopped) => {
                if inner.shutdown_state() == SHUTDOWN_NONE {
                    // The queue was stopped out from under a live pool;
                    // keep serving inboxes and steals at the wake cadence.
                    std::thread::sleep(inner.config.wake_interval);
                }
            }
            Err(_) => {}
        }
    }

    debug!(worker = context.id, "worker exiting");
    events::emit(
        &inner.sink(),
        EngineEvent::WorkerStopped {
            worker_id: context.id,
        },
    );
}

fn has_visible_work(context: &WorkerContext) -> bool {
    let local_occupied = context
        .local
        .as_ref()
        .map(|deque| !deque.is_empty())
        .unwrap_or(false);
    local_occupied
        || !context.inner.inboxes[context.id].is_empty()
        || !context.inner.queue.is_empty()
}

fn publish_depth(context: &WorkerContext) {
    if let Some(local) = context.local.as_ref() {
        context.inner.depth_board.publish(context.id, local.len());
    }
}

fn take_from_inbox(context: &WorkerContext) -> Option<Job> {
    let inbox = &context.inner.inboxes[context.id];
    match context.local.as_ref() {
        Some(local) => {
            let mut moved = false;
            while let Some(job) = inbox.pop() {
                local.push(job);
                moved = true;
            }
            if moved {
                let job = local.pop();
                publish_depth(context);
                job
            } else {
                None
            }
        }
        None => inbox.pop(),
    }
}

fn take_from_queue(context: &WorkerContext, stealing: bool) -> Option<Job> {
    if !stealing {
        return context.inner.queue.try_dequeue();
    }

    let fetch = context.inner.config.stealing.max_steal_batch.max(1);
    let mut batch = context.inner.queue.dequeue_batch(fetch);
    if batch.is_empty() {
        return None;
    }
    let job = batch.remove(0);
    if let Some(local) = context.local.as_ref() {
        for queued in batch {
            local.push(queued);
        }
    }
    publish_depth(context);
    Some(job)
}

fn try_steal(context: &WorkerContext, selector: &mut VictimSelector) -> Option<Job> {
    let local = context.local.as_ref()?;
    let config = &context.inner.config.stealing;

    for victim in selector.choose(config.max_steal_attempts) {
        context.inner.steal_stats.record_attempt();
        let limit = steal_batch_size(config, context.inner.depth_board.read(victim));
        let before = local.len();

        let mut outcome = context.stealers[victim].steal_batch_with_limit_and_pop(local, limit);
        while matches!(outcome, Steal::Retry) {
            outcome = context.stealers[victim].steal_batch_with_limit_and_pop(local, limit);
        }

        match outcome {
            Steal::Success(job) => {
                let moved = (local.len() - before + 1) as u64;
                context.inner.steal_stats.record_success(moved);
                selector.record_outcome(victim, true);
                publish_depth(context);
                trace!(
                    thief = context.id,
                    victim,
                    moved,
                    "stole jobs from peer"
                );
                return Some(job);
            }
            _ => {
                context.inner.steal_stats.record_failure();
                selector.record_outcome(victim, false);
            }
        }
    }
    None
}

fn execute_job(context: &WorkerContext, mut job: Job) {
    let inner = &context.inner;

    // Cancelled before dispatch: no callbacks fire, only the count moves.
    if job.is_cancelled() {
        trace!(job_id = job.id(), "job cancelled before dispatch");
        inner.stats.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let deadline_handle = match (job.timeout(), job.cancellation_token()) {
        (Some(timeout), Some(token)) => Some(
            inner
                .watchdog
                .register(Instant::now() + timeout, token.clone()),
        ),
        _ => None,
    };

    let policies = inner.policies_snapshot();
    for policy in &policies {
        policy.on_job_start(&job);
    }

    let started = Instant::now();
    let result = job.execute();
    inner.queue.record_service_time(started.elapsed());

    if let Some(handle) = deadline_handle {
        handle.complete();
    }

    for policy in &policies {
        policy.on_job_complete(&job, result.is_ok(), result.as_ref().err());
    }

    match &result {
        Ok(()) => {
            inner.stats.jobs_executed.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) if err.is_cancellation() => {
            inner.stats.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            inner.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);

            // A tripped token prevents re-queueing even when attempts
            // remain.
            let mut retry_delay = None;
            if !job.is_cancelled() && err.is_retryable() {
                if let Some(policy) = job.retry_policy_mut() {
                    if policy.has_attempts_remaining() {
                        policy.record_attempt();
                        retry_delay = Some(policy.delay_for_current_attempt());
                    }
                }
            }

            if let Some(delay) = retry_delay {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                inner.stats.jobs_retried.fetch_add(1, Ordering::Relaxed);
                let job_id = job.id();
                debug!(job_id, "re-enqueueing failed job for retry");
                if let Err(requeue_err) = inner.queue.enqueue(job) {
                    warn!(
                        job_id,
                        error = %requeue_err,
                        "retry re-enqueue failed, abandoning job"
                    );
                }
            }
        }
    }
}
