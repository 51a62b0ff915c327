//! Worker pool lifecycle, policies, and job composition
//!
//! Covers the lifecycle contract (idempotent start, terminal stop, zero
//! workers), callback exactly-once delivery, retries, cooperative
//! cancellation, advisory timeouts, and policy rejection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serial_test::serial;

use gantry::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use gantry::error::EngineError;
use gantry::job::{CancellationToken, JobBuilder, RetryPolicy};
use gantry::pool::{CircuitBreakerPolicy, PoolConfig, WorkerPool};
use gantry::queue::BackpressureConfig;

fn pool(workers: usize) -> WorkerPool {
    WorkerPool::new(
        "pool-tests",
        PoolConfig {
            worker_count: workers,
            queue_capacity: 256,
            backpressure: BackpressureConfig::default(),
            wake_interval: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn test_double_start_is_rejected() {
    let pool = pool(1);
    pool.start().unwrap();
    assert!(matches!(pool.start(), Err(EngineError::AlreadyRunning(_))));
    pool.stop(false).unwrap();
}

#[test]
fn test_stop_without_start_fails() {
    let pool = pool(1);
    assert!(matches!(pool.stop(false), Err(EngineError::NotRunning(_))));
}

#[test]
fn test_zero_worker_pool_executes_nothing() {
    let pool = pool(0);
    let ran = Arc::new(AtomicUsize::new(0));
    pool.start().unwrap();

    let ran_clone = ran.clone();
    pool.submit(
        JobBuilder::new()
            .work(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap(),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    pool.stop(true).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
#[serial]
fn test_on_complete_fires_exactly_once_per_job() {
    let pool = pool(4);
    let completions = Arc::new(AtomicUsize::new(0));
    pool.start().unwrap();

    for i in 0..50 {
        let completions = completions.clone();
        let fails = i % 3 == 0;
        pool.submit(
            JobBuilder::new()
                .name(format!("cb-{i}"))
                .work(move || {
                    if fails {
                        Err(EngineError::JobExecutionFailed("expected".into()))
                    } else {
                        Ok(())
                    }
                })
                .on_complete(move |_| {
                    completions.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    }

    pool.stop(false).unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 50);
}

#[test]
#[serial]
fn test_retry_policy_reexecutes_until_success() {
    let pool = pool(1);
    let attempts = Arc::new(AtomicUsize::new(0));
    pool.start().unwrap();

    let attempts_clone = attempts.clone();
    pool.submit(
        JobBuilder::new()
            .name("flaky")
            .work(move || {
                let attempt = attempts_clone.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(EngineError::JobExecutionFailed("transient".into()))
                } else {
                    Ok(())
                }
            })
            .retry(RetryPolicy::fixed(5, Duration::from_millis(5)))
            .build()
            .unwrap(),
    )
    .unwrap();

    pool.stop(false).unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let stats = pool.stats();
    assert_eq!(stats.jobs_executed, 1);
    assert_eq!(stats.jobs_failed, 2);
    assert_eq!(stats.jobs_retried, 2);
}

#[test]
#[serial]
fn test_retry_exhaustion_stops_reexecution() {
    let pool = pool(1);
    let attempts = Arc::new(AtomicUsize::new(0));
    pool.start().unwrap();

    let attempts_clone = attempts.clone();
    pool.submit(
        JobBuilder::new()
            .name("doomed")
            .work(move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::JobExecutionFailed("permanent".into()))
            })
            .retry(RetryPolicy::fixed(3, Duration::from_millis(2)))
            .build()
            .unwrap(),
    )
    .unwrap();

    pool.stop(false).unwrap();
    // max_attempts includes the initial execution.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
#[serial]
fn test_cancelled_before_dispatch_skips_work_and_callbacks() {
    let pool = pool(1);
    let token = CancellationToken::new();
    let ran = Arc::new(AtomicUsize::new(0));
    let callbacks = Arc::new(AtomicUsize::new(0));

    let ran_clone = ran.clone();
    let callbacks_clone = callbacks.clone();
    pool.submit(
        JobBuilder::new()
            .name("cancelled")
            .work(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .cancellation(token.clone())
            .on_complete(move |_| {
                callbacks_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap(),
    )
    .unwrap();

    // Trip before any worker exists, then start.
    token.cancel();
    pool.start().unwrap();
    pool.stop(false).unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(callbacks.load(Ordering::SeqCst), 0);
    assert_eq!(pool.stats().jobs_cancelled, 1);
}

#[test]
#[serial]
fn test_cancellation_prevents_retry_requeue() {
    let pool = pool(1);
    let token = CancellationToken::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    pool.start().unwrap();

    let attempts_clone = attempts.clone();
    let cancel_on_first = token.clone();
    pool.submit(
        JobBuilder::new()
            .name("cancelled-retry")
            .work(move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                // The job cancels itself mid-run, then fails.
                cancel_on_first.cancel();
                Err(EngineError::JobExecutionFailed("after cancel".into()))
            })
            .cancellation(token.clone())
            .retry(RetryPolicy::fixed(5, Duration::from_millis(2)))
            .build()
            .unwrap(),
    )
    .unwrap();

    pool.stop(false).unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn test_timeout_trips_token_during_execution() {
    let pool = pool(1);
    let observed = Arc::new(Mutex::new(None));
    pool.start().unwrap();

    let token = CancellationToken::new();
    let observed_clone = observed.clone();
    let watch = token.clone();
    pool.submit(
        JobBuilder::new()
            .name("slow")
            .cancellation(token.clone())
            .timeout(Duration::from_millis(30))
            .work(move || {
                // Cooperative loop: exit when the watchdog trips the token.
                for _ in 0..200 {
                    if watch.is_cancelled() {
                        *observed_clone.lock() = Some(true);
                        return Err(EngineError::OperationCanceled("timed out".into()));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                *observed_clone.lock() = Some(false);
                Ok(())
            })
            .build()
            .unwrap(),
    )
    .unwrap();

    pool.stop(false).unwrap();
    assert_eq!(*observed.lock(), Some(true));
}

#[test]
#[serial]
fn test_panicking_job_does_not_kill_worker() {
    let pool = pool(1);
    let survived = Arc::new(AtomicUsize::new(0));
    pool.start().unwrap();

    pool.submit(
        JobBuilder::new()
            .name("panicker")
            .work(|| panic!("intentional"))
            .build()
            .unwrap(),
    )
    .unwrap();

    let survived_clone = survived.clone();
    pool.submit(
        JobBuilder::new()
            .name("survivor")
            .work(move || {
                survived_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap(),
    )
    .unwrap();

    pool.stop(false).unwrap();
    assert_eq!(survived.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().jobs_failed, 1);
}

#[test]
#[serial]
fn test_open_circuit_rejects_submissions_fast() {
    let pool = pool(2);
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        failure_rate_threshold: 0.0,
        open_duration: Duration::from_secs(60),
        ..Default::default()
    }));
    pool.add_policy(Arc::new(CircuitBreakerPolicy::new(breaker.clone())));
    pool.start().unwrap();

    for i in 0..3 {
        pool.submit(
            JobBuilder::new()
                .name(format!("fail-{i}"))
                .work(|| Err(EngineError::JobExecutionFailed("downstream".into())))
                .build()
                .unwrap(),
        )
        .unwrap();
    }

    // Let the failures complete and open the circuit.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while breaker.state() != CircuitState::Open && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let result = pool.submit(
        JobBuilder::new()
            .name("rejected")
            .work(|| Ok(()))
            .build()
            .unwrap(),
    );
    assert!(matches!(result, Err(EngineError::CircuitOpen)));

    pool.stop(false).unwrap();
}
