//! Structured engine events
//!
//! The engine emits typed events at the seams an external logging or metrics
//! layer cares about: pressure changes, drops and rejections, circuit state
//! transitions, DAG state transitions, and worker lifecycle. The engine never
//! formats or persists these itself; it hands them to an injected
//! [`EventSink`] and mirrors them through `tracing` so the crate stays
//! observable without one.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::queue::PressureLevel;

/// A structured event emitted by the engine
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    /// Queue pressure level changed
    PressureChanged {
        /// New pressure level
        level: PressureLevel,
        /// Queue depth at the transition
        depth: usize,
        /// Depth as a ratio of capacity
        ratio: f64,
    },
    /// A job was rejected at admission
    JobRejected {
        /// Job identifier
        job_id: u64,
        /// Stable error kind, e.g. `queue_full`
        reason: String,
    },
    /// A queued job was dropped to make room
    JobDropped {
        /// Job identifier
        job_id: u64,
        /// Stable error kind or policy name
        reason: String,
    },
    /// Circuit breaker changed state
    CircuitStateChanged {
        /// Previous state name
        old: &'static str,
        /// New state name
        new: &'static str,
    },
    /// A DAG job transitioned between states
    DagJobStateChanged {
        /// DAG node identifier
        dag_id: u64,
        /// Previous state name
        old: &'static str,
        /// New state name
        new: &'static str,
    },
    /// A worker thread started
    WorkerStarted {
        /// Worker index within its pool
        worker_id: usize,
    },
    /// A worker thread stopped
    WorkerStopped {
        /// Worker index within its pool
        worker_id: usize,
    },
}

/// Sink for engine events
///
/// Implementations must be cheap: events fire on hot paths (enqueue,
/// completion) from worker threads.
pub trait EventSink: Send + Sync {
    /// Receive one event
    fn emit(&self, event: &EngineEvent);
}

/// Sink that discards all events
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &EngineEvent) {}
}

/// Shared sink handle used throughout the engine
pub type SharedSink = Arc<dyn EventSink>;

/// Default sink: discard
pub fn null_sink() -> SharedSink {
    Arc::new(NullSink)
}

/// Emit an event to the sink and mirror it through tracing
pub(crate) fn emit(sink: &SharedSink, event: EngineEvent) {
    match &event {
        EngineEvent::PressureChanged { level, depth, ratio } => {
            debug!(?level, depth, ratio, "queue pressure changed");
        }
        EngineEvent::JobRejected { job_id, reason } => {
            warn!(job_id, reason = reason.as_str(), "job rejected");
        }
        EngineEvent::JobDropped { job_id, reason } => {
            warn!(job_id, reason = reason.as_str(), "job dropped");
        }
        EngineEvent::CircuitStateChanged { old, new } => {
            if *new == "open" {
                warn!(old, new, "circuit state changed");
            } else {
                debug!(old, new, "circuit state changed");
            }
        }
        EngineEvent::DagJobStateChanged { dag_id, old, new } => {
            debug!(dag_id, old, new, "dag job state changed");
        }
        EngineEvent::WorkerStarted { worker_id } => {
            debug!(worker_id, "worker started");
        }
        EngineEvent::WorkerStopped { worker_id } => {
            debug!(worker_id, "worker stopped");
        }
    }
    sink.emit(&event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: &EngineEvent) {
            self.events.lock().push(format!("{event:?}"));
        }
    }

    #[test]
    fn test_sink_receives_events() {
        let sink = Arc::new(RecordingSink {
            events: Mutex::new(Vec::new()),
        });
        let shared: SharedSink = sink.clone();

        emit(
            &shared,
            EngineEvent::WorkerStarted { worker_id: 3 },
        );
        emit(
            &shared,
            EngineEvent::JobRejected {
                job_id: 42,
                reason: "queue_full".into(),
            },
        );

        let events = sink.events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("WorkerStarted"));
        assert!(events[1].contains("queue_full"));
    }

    #[test]
    fn test_null_sink_is_silent() {
        let sink = null_sink();
        emit(
            &sink,
            EngineEvent::CircuitStateChanged { old: "closed", new: "open" },
        );
    }
}
