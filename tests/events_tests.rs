//! Event sink integration
//!
//! The engine hands structured events to the injected sink; this suite
//! checks the seams: pressure changes, rejections, circuit transitions,
//! worker lifecycle, and DAG state changes.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serial_test::serial;

use gantry::breaker::{CircuitBreaker, CircuitBreakerConfig};
use gantry::dag::{DagConfig, DagJob, DagScheduler};
use gantry::error::EngineError;
use gantry::events::{EngineEvent, EventSink};
use gantry::job::JobBuilder;
use gantry::pool::{PoolConfig, WorkerPool};
use gantry::queue::{BackpressureConfig, BackpressurePolicy};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn labels(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &EngineEvent) {
        let label = match event {
            EngineEvent::PressureChanged { level, .. } => {
                format!("pressure:{}", level.as_str())
            }
            EngineEvent::JobRejected { reason, .. } => format!("rejected:{reason}"),
            EngineEvent::JobDropped { reason, .. } => format!("dropped:{reason}"),
            EngineEvent::CircuitStateChanged { old, new } => format!("circuit:{old}->{new}"),
            EngineEvent::DagJobStateChanged { old, new, .. } => format!("dag:{old}->{new}"),
            EngineEvent::WorkerStarted { worker_id } => format!("worker-start:{worker_id}"),
            EngineEvent::WorkerStopped { worker_id } => format!("worker-stop:{worker_id}"),
        };
        self.events.lock().push(label);
    }
}

#[test]
#[serial]
fn test_pool_emits_worker_and_queue_events() {
    let sink = Arc::new(RecordingSink::default());
    let pool = WorkerPool::new(
        "events",
        PoolConfig {
            worker_count: 1,
            queue_capacity: 2,
            backpressure: BackpressureConfig {
                policy: BackpressurePolicy::DropNewest,
                ..Default::default()
            },
            wake_interval: Duration::from_millis(5),
            ..Default::default()
        },
    )
    .unwrap();
    pool.set_event_sink(sink.clone());

    // Fill the queue before starting so one submission is rejected.
    for i in 0..3 {
        let _ = pool.submit(
            JobBuilder::new()
                .name(format!("j{i}"))
                .work(|| Ok(()))
                .build()
                .unwrap(),
        );
    }
    pool.start().unwrap();
    pool.stop(false).unwrap();

    let labels = sink.labels();
    assert!(labels.iter().any(|l| l == "rejected:queue_full"));
    assert!(labels.iter().any(|l| l.starts_with("pressure:")));
    assert!(labels.iter().any(|l| l == "worker-start:0"));
    assert!(labels.iter().any(|l| l == "worker-stop:0"));
}

#[test]
fn test_breaker_emits_transition_events() {
    let sink = Arc::new(RecordingSink::default());
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        failure_rate_threshold: 0.0,
        open_duration: Duration::from_millis(30),
        half_open_max_requests: 1,
        half_open_success_threshold: 1,
        ..Default::default()
    });
    breaker.set_event_sink(sink.clone());

    breaker.record_failure(&EngineError::JobExecutionFailed("x".into()));
    std::thread::sleep(Duration::from_millis(40));
    assert!(breaker.allow_request());
    breaker.record_success();

    let labels = sink.labels();
    assert!(labels.contains(&"circuit:closed->open".to_string()));
    assert!(labels.contains(&"circuit:open->half_open".to_string()));
    assert!(labels.contains(&"circuit:half_open->closed".to_string()));
}

#[test]
#[serial]
fn test_dag_emits_state_transitions() {
    let sink = Arc::new(RecordingSink::default());
    let pool = Arc::new(
        WorkerPool::new(
            "dag-events",
            PoolConfig {
                worker_count: 1,
                wake_interval: Duration::from_millis(5),
                ..Default::default()
            },
        )
        .unwrap(),
    );
    pool.start().unwrap();

    let dag = DagScheduler::new(pool.clone(), DagConfig::default());
    dag.set_event_sink(sink.clone());
    dag.add_job(DagJob::new("only").with_work(|| Ok(())));
    dag.execute_all().unwrap().wait().unwrap();

    let labels = sink.labels();
    assert!(labels.contains(&"dag:pending->ready".to_string()));
    assert!(labels.contains(&"dag:ready->running".to_string()));
    assert!(labels.contains(&"dag:running->completed".to_string()));

    pool.stop(false).unwrap();
}
