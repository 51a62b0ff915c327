//! Backpressure queue scenarios
//!
//! End-to-end behavior of the bounded queue under load: blocking with
//! timeout, drop-oldest shedding, rate limiting, FIFO ordering, and the
//! accounting identity of the statistics snapshot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serial_test::serial;

use gantry::error::EngineError;
use gantry::job::{Job, JobBuilder};
use gantry::pool::{PoolConfig, WorkerPool};
use gantry::queue::{
    BackpressureConfig, BackpressurePolicy, BackpressureQueue, RateLimitConfig,
};

fn sleeper(duration: Duration, log: &Arc<Mutex<Vec<String>>>, name: &str) -> Job {
    let log = log.clone();
    let name = name.to_string();
    JobBuilder::new()
        .name(&name)
        .work(move || {
            std::thread::sleep(duration);
            log.lock().push(name.clone());
            Ok(())
        })
        .build()
        .unwrap()
}

fn quick(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Job {
    sleeper(Duration::ZERO, log, name)
}

#[test]
#[serial]
fn test_blocking_enqueue_admits_after_drain_and_times_out_when_full() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::new(
        "block-scenario",
        PoolConfig {
            worker_count: 2,
            queue_capacity: 2,
            backpressure: BackpressureConfig {
                policy: BackpressurePolicy::Block,
                block_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            wake_interval: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    )
    .unwrap();
    pool.start().unwrap();

    // Two long jobs occupy both workers; two more fill the queue.
    for name in ["w1", "w2"] {
        pool.submit(sleeper(Duration::from_millis(200), &log, name)).unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));
    for name in ["q1", "q2"] {
        pool.submit(quick(name, &log)).unwrap();
    }

    // The next enqueue blocks until a worker frees a queue slot, well
    // within the first job's runtime plus slack.
    let started = Instant::now();
    let queue = pool.queue().clone();
    let admitted = std::thread::spawn(move || {
        let result = queue.enqueue(Job::new("q3", Box::new(|| Ok(()))));
        (result, started.elapsed())
    });
    let (result, elapsed) = admitted.join().unwrap();
    // 50ms block timeout: whether it lands depends on drain timing; what
    // must hold is that a full queue bounded the wait.
    if result.is_ok() {
        assert!(elapsed < Duration::from_millis(300));
    } else {
        assert!(matches!(result, Err(EngineError::OperationTimeout(_))));
        assert!(elapsed >= Duration::from_millis(45));
    }

    pool.stop(false).unwrap();
}

#[test]
#[serial]
fn test_drop_oldest_executes_newest_jobs() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::new(
        "drop-oldest-scenario",
        PoolConfig {
            worker_count: 1,
            queue_capacity: 3,
            backpressure: BackpressureConfig {
                policy: BackpressurePolicy::DropOldest,
                ..Default::default()
            },
            wake_interval: Duration::from_millis(5),
            ..Default::default()
        },
    )
    .unwrap();

    // No workers running yet: A and B fall off the front.
    for name in ["A", "B", "C", "D", "E"] {
        pool.submit(quick(name, &log)).unwrap();
    }
    assert_eq!(pool.queue().stats().jobs_dropped, 2);

    pool.start().unwrap();
    pool.stop(false).unwrap();

    assert_eq!(log.lock().as_slice(), ["C", "D", "E"]);
}

#[test]
#[serial]
fn test_token_bucket_ceiling_is_enforced() {
    // Scaled version of the rate-limit scenario: burst 5 free, the rest
    // at 200/s. 25 jobs -> at least 20 paced tokens -> >= ~100ms.
    let queue = BackpressureQueue::new(
        1_000,
        BackpressureConfig {
            policy: BackpressurePolicy::Block,
            block_timeout: Duration::from_secs(5),
            rate_limit: RateLimitConfig {
                enabled: true,
                tokens_per_second: 200,
                burst_size: 5,
            },
            ..Default::default()
        },
    )
    .unwrap();

    let started = Instant::now();
    for i in 0..25 {
        queue
            .enqueue(Job::new(format!("j{i}"), Box::new(|| Ok(()))))
            .unwrap();
    }
    let elapsed = started.elapsed();

    assert_eq!(queue.len(), 25);
    assert_eq!(queue.stats().jobs_accepted, 25);
    assert!(
        elapsed >= Duration::from_millis(90),
        "25 jobs admitted in {elapsed:?}, faster than the token ceiling allows"
    );
}

#[test]
fn test_fifo_order_without_stealing() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::new(
        "fifo",
        PoolConfig {
            worker_count: 1,
            queue_capacity: 64,
            wake_interval: Duration::from_millis(5),
            ..Default::default()
        },
    )
    .unwrap();

    let expected: Vec<String> = (0..32).map(|i| format!("job-{i}")).collect();
    for name in &expected {
        pool.submit(quick(name, &log)).unwrap();
    }
    pool.start().unwrap();
    pool.stop(false).unwrap();

    assert_eq!(log.lock().as_slice(), expected.as_slice());
}

#[test]
fn test_stats_identity_under_mixed_outcomes() {
    let queue = BackpressureQueue::new(
        4,
        BackpressureConfig {
            policy: BackpressurePolicy::DropNewest,
            ..Default::default()
        },
    )
    .unwrap();

    let attempts = 10u64;
    for i in 0..attempts {
        let _ = queue.enqueue(Job::new(format!("j{i}"), Box::new(|| Ok(()))));
    }

    let stats = queue.stats();
    assert!(stats.jobs_accepted + stats.jobs_rejected + stats.jobs_dropped <= attempts);
    assert_eq!(stats.jobs_accepted, 4);
    assert_eq!(stats.jobs_rejected, 6);
}

#[test]
fn test_pressure_callback_reports_depth_and_ratio() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let queue = BackpressureQueue::new(
        10,
        BackpressureConfig {
            policy: BackpressurePolicy::DropNewest,
            low_watermark: 0.2,
            high_watermark: 0.6,
            pressure_callback: Some(Arc::new(move |depth, ratio| {
                seen_clone.lock().push((depth, ratio));
            })),
            ..Default::default()
        },
    )
    .unwrap();

    for i in 0..10 {
        queue
            .enqueue(Job::new(format!("j{i}"), Box::new(|| Ok(()))))
            .unwrap();
    }

    let seen = seen.lock();
    assert!(!seen.is_empty());
    for (depth, ratio) in seen.iter() {
        assert!(*depth <= 10);
        assert!((ratio - *depth as f64 / 10.0).abs() < 1e-9);
    }
}

#[test]
fn test_batch_enqueue_counts_once_per_decision() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let queue = BackpressureQueue::new(
        2,
        BackpressureConfig {
            policy: BackpressurePolicy::Callback,
            decision_callback: Some(Arc::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                gantry::queue::BackpressureDecision::Reject
            })),
            ..Default::default()
        },
    )
    .unwrap();

    queue
        .enqueue(Job::new("seed-a", Box::new(|| Ok(()))))
        .unwrap();
    queue
        .enqueue(Job::new("seed-b", Box::new(|| Ok(()))))
        .unwrap();

    let batch: Vec<Job> = (0..2)
        .map(|i| Job::new(format!("b{i}"), Box::new(|| Ok(()))))
        .collect();
    assert!(queue.enqueue_batch(batch).is_err());

    // One decision for the whole batch, not one per job.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
