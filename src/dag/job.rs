//! DAG node
//!
//! A [`DagJob`] is one node in a dependency graph: a work function, a
//! fluently declared dependency list, an atomic state machine, an optional
//! typed result for downstream nodes, and timing marks. Dependencies are
//! held as ids and resolved through the owning graph, never as pointers, so
//! reference cycles are impossible by construction.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult, VoidResult};

/// Node identifier, unique within the process lifetime
pub type DagJobId = u64;

/// Id value never assigned to a node
pub const INVALID_DAG_JOB_ID: DagJobId = 0;

static NEXT_DAG_ID: AtomicU64 = AtomicU64::new(1);

/// Node state
///
/// Progression: `pending → ready → running → {completed, failed,
/// cancelled}`, with `pending/ready → skipped/cancelled` shortcuts when a
/// dependency fails or the run is cancelled. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DagJobState {
    /// Waiting for dependencies
    Pending,
    /// Dependencies satisfied; eligible for dispatch
    Ready,
    /// Executing on a worker
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by the user or a dependency failure
    Cancelled,
    /// Skipped because a dependency failed
    Skipped,
}

impl DagJobState {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            DagJobState::Pending => "pending",
            DagJobState::Ready => "ready",
            DagJobState::Running => "running",
            DagJobState::Completed => "completed",
            DagJobState::Failed => "failed",
            DagJobState::Cancelled => "cancelled",
            DagJobState::Skipped => "skipped",
        }
    }

    /// Whether the state never changes again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DagJobState::Completed
                | DagJobState::Failed
                | DagJobState::Cancelled
                | DagJobState::Skipped
        )
    }
}

fn state_to_u8(state: DagJobState) -> u8 {
    match state {
        DagJobState::Pending => 0,
        DagJobState::Ready => 1,
        DagJobState::Running => 2,
        DagJobState::Completed => 3,
        DagJobState::Failed => 4,
        DagJobState::Cancelled => 5,
        DagJobState::Skipped => 6,
    }
}

fn state_from_u8(value: u8) -> DagJobState {
    match value {
        0 => DagJobState::Pending,
        1 => DagJobState::Ready,
        2 => DagJobState::Running,
        3 => DagJobState::Completed,
        4 => DagJobState::Failed,
        5 => DagJobState::Cancelled,
        _ => DagJobState::Skipped,
    }
}

/// Work function for a node
pub type DagWorkFn = Box<dyn Fn() -> VoidResult + Send + Sync>;

type ResultSlot = Arc<Mutex<Option<Box<dyn Any + Send + Sync>>>>;

/// One node in a dependency graph
pub struct DagJob {
    dag_id: DagJobId,
    name: String,
    state: AtomicU8,
    declared_dependencies: Vec<DagJobId>,
    work: Option<DagWorkFn>,
    fallback: Option<DagWorkFn>,
    result: ResultSlot,
    error_message: Mutex<Option<String>>,
    submit_time: Instant,
    start_time: Mutex<Option<Instant>>,
    end_time: Mutex<Option<Instant>>,
}

impl DagJob {
    /// Create a node with a human-readable name and no work
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            dag_id: NEXT_DAG_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: AtomicU8::new(state_to_u8(DagJobState::Pending)),
            declared_dependencies: Vec::new(),
            work: None,
            fallback: None,
            result: Arc::new(Mutex::new(None)),
            error_message: Mutex::new(None),
            submit_time: Instant::now(),
            start_time: Mutex::new(None),
            end_time: Mutex::new(None),
        }
    }

    /// Set the work function
    pub fn with_work<F>(mut self, work: F) -> Self
    where
        F: Fn() -> VoidResult + Send + Sync + 'static,
    {
        self.work = Some(Box::new(work));
        self
    }

    /// Set a work function whose success value is stored for dependents
    pub fn with_result_work<T, F>(mut self, work: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> EngineResult<T> + Send + Sync + 'static,
    {
        let slot = self.result.clone();
        self.work = Some(Box::new(move || {
            let value = work()?;
            *slot.lock() = Some(Box::new(value));
            Ok(())
        }));
        self
    }

    /// Set the fallback function run under the fallback failure policy
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn() -> VoidResult + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Declare a dependency on another node
    pub fn with_dependency(mut self, dependency: DagJobId) -> Self {
        if dependency != INVALID_DAG_JOB_ID {
            self.declared_dependencies.push(dependency);
        }
        self
    }

    /// Declare several dependencies
    pub fn with_dependencies(mut self, dependencies: &[DagJobId]) -> Self {
        for &dependency in dependencies {
            if dependency != INVALID_DAG_JOB_ID {
                self.declared_dependencies.push(dependency);
            }
        }
        self
    }

    /// Node id
    pub fn dag_id(&self) -> DagJobId {
        self.dag_id
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dependencies declared before the node was added to a graph
    pub fn declared_dependencies(&self) -> &[DagJobId] {
        &self.declared_dependencies
    }

    /// Current state (atomic read)
    pub fn state(&self) -> DagJobState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomic state transition; false when the current state is not
    /// `expected`
    pub fn try_transition(&self, expected: DagJobState, desired: DagJobState) -> bool {
        self.state
            .compare_exchange(
                state_to_u8(expected),
                state_to_u8(desired),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Whether a fallback function is attached
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Whether a result value is stored
    pub fn has_result(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Typed copy of the stored result
    ///
    /// Fails loudly: `job_invalid` when no result is stored,
    /// `invalid_argument` when the stored type does not match `T`.
    pub fn result_as<T: Clone + 'static>(&self) -> EngineResult<T> {
        let guard = self.result.lock();
        match guard.as_ref() {
            None => Err(EngineError::JobInvalid(format!(
                "dag job {} holds no result",
                self.dag_id
            ))),
            Some(value) => value.downcast_ref::<T>().cloned().ok_or_else(|| {
                EngineError::InvalidArgument(format!(
                    "dag job {} result is not a {}",
                    self.dag_id,
                    std::any::type_name::<T>()
                ))
            }),
        }
    }

    /// Stored error message, if the node failed
    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().clone()
    }

    pub(crate) fn set_error_message(&self, message: String) {
        *self.error_message.lock() = Some(message);
    }

    pub(crate) fn record_start(&self) {
        *self.start_time.lock() = Some(Instant::now());
    }

    pub(crate) fn record_end(&self) {
        *self.end_time.lock() = Some(Instant::now());
    }

    /// Time from graph insertion to execution start
    pub fn wait_time(&self) -> Duration {
        self.start_time
            .lock()
            .map(|start| start.duration_since(self.submit_time))
            .unwrap_or(Duration::ZERO)
    }

    /// Execution duration, zero until finished
    pub fn execution_time(&self) -> Duration {
        let start = self.start_time.lock();
        let end = self.end_time.lock();
        match (*start, *end) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Run the work function, converting panics to `job_execution_failed`
    pub(crate) fn run_work(&self) -> VoidResult {
        match self.work.as_ref() {
            None => Ok(()),
            Some(work) => {
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work())) {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::JobExecutionFailed(format!(
                        "dag job '{}' panicked",
                        self.name
                    ))),
                }
            }
        }
    }

    /// Run the fallback, if any
    pub(crate) fn run_fallback(&self) -> Option<VoidResult> {
        self.fallback.as_ref().map(|fallback| {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fallback())) {
                Ok(result) => result,
                Err(_) => Err(EngineError::JobExecutionFailed(format!(
                    "dag job '{}' fallback panicked",
                    self.name
                ))),
            }
        })
    }

}

impl std::fmt::Debug for DagJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagJob")
            .field("dag_id", &self.dag_id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("dependencies", &self.declared_dependencies)
            .finish()
    }
}

/// Snapshot of one node for monitoring
#[derive(Debug, Clone)]
pub struct DagJobInfo {
    /// Node id
    pub id: DagJobId,
    /// Node name
    pub name: String,
    /// State at snapshot time
    pub state: DagJobState,
    /// Nodes this node depends on
    pub dependencies: Vec<DagJobId>,
    /// Nodes depending on this node
    pub dependents: Vec<DagJobId>,
    /// Error message if failed
    pub error_message: Option<String>,
    /// Whether a result value is stored
    pub has_result: bool,
    /// Time from insertion to execution start
    pub wait_time: Duration,
    /// Execution duration
    pub execution_time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = DagJob::new("a");
        let b = DagJob::new("b");
        assert_ne!(a.dag_id(), b.dag_id());
        assert_ne!(a.dag_id(), INVALID_DAG_JOB_ID);
    }

    #[test]
    fn test_state_transitions() {
        let job = DagJob::new("t");
        assert_eq!(job.state(), DagJobState::Pending);

        assert!(job.try_transition(DagJobState::Pending, DagJobState::Ready));
        assert!(job.try_transition(DagJobState::Ready, DagJobState::Running));
        // Wrong expected state is refused.
        assert!(!job.try_transition(DagJobState::Pending, DagJobState::Completed));
        assert!(job.try_transition(DagJobState::Running, DagJobState::Completed));
        assert!(job.state().is_terminal());
    }

    #[test]
    fn test_result_round_trip() {
        let job = DagJob::new("calc").with_result_work(|| Ok(42_i64));
        assert!(job.run_work().is_ok());
        assert!(job.has_result());
        assert_eq!(job.result_as::<i64>().unwrap(), 42);
    }

    #[test]
    fn test_result_type_mismatch_fails_loudly() {
        let job = DagJob::new("calc").with_result_work(|| Ok("text".to_string()));
        assert!(job.run_work().is_ok());
        assert!(matches!(
            job.result_as::<i64>(),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_missing_result_fails_loudly() {
        let job = DagJob::new("empty");
        assert!(matches!(
            job.result_as::<i64>(),
            Err(EngineError::JobInvalid(_))
        ));
    }

    #[test]
    fn test_panicking_work_is_contained() {
        let job = DagJob::new("explosive").with_work(|| panic!("boom"));
        assert!(matches!(
            job.run_work(),
            Err(EngineError::JobExecutionFailed(_))
        ));
    }

    #[test]
    fn test_invalid_dependency_ignored() {
        let job = DagJob::new("d").with_dependency(INVALID_DAG_JOB_ID);
        assert!(job.declared_dependencies().is_empty());
    }
}
