//! DAG scheduler configuration and statistics

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dag::job::{DagJobId, DagJobState};
use crate::error::{EngineError, EngineResult};

/// How the scheduler responds to a failed node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DagFailurePolicy {
    /// Cancel all dependents immediately; the first error is reported
    FailFast,
    /// Skip dependents; unrelated branches continue
    ContinueOthers,
    /// Re-submit the failed node up to `max_retries` times
    Retry,
    /// Run the node's fallback function, if it has one
    Fallback,
}

impl DagFailurePolicy {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            DagFailurePolicy::FailFast => "fail_fast",
            DagFailurePolicy::ContinueOthers => "continue_others",
            DagFailurePolicy::Retry => "retry",
            DagFailurePolicy::Fallback => "fallback",
        }
    }
}

/// Callback on every node state transition `(id, old, new)`
pub type DagStateCallback = Arc<dyn Fn(DagJobId, DagJobState, DagJobState) + Send + Sync>;

/// Callback on node failure `(id, error)`
pub type DagErrorCallback = Arc<dyn Fn(DagJobId, &EngineError) + Send + Sync>;

/// Callback on node completion `(id)`
pub type DagCompletionCallback = Arc<dyn Fn(DagJobId) + Send + Sync>;

/// DAG scheduler configuration
#[derive(Clone)]
pub struct DagConfig {
    /// Failure handling policy
    pub failure_policy: DagFailurePolicy,
    /// Retry budget per node under the retry policy
    pub max_retries: usize,
    /// Delay between retry attempts
    pub retry_delay: Duration,
    /// Reject dependency edges that would create a cycle
    pub detect_cycles: bool,
    /// Run independent ready nodes concurrently; serialized otherwise
    pub execute_in_parallel: bool,
    /// Invoked on every state transition
    pub state_callback: Option<DagStateCallback>,
    /// Invoked when a node fails
    pub error_callback: Option<DagErrorCallback>,
    /// Invoked when a node completes
    pub completion_callback: Option<DagCompletionCallback>,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            failure_policy: DagFailurePolicy::FailFast,
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
            detect_cycles: true,
            execute_in_parallel: true,
            state_callback: None,
            error_callback: None,
            completion_callback: None,
        }
    }
}

impl DagConfig {
    /// Validate retry-policy coherence
    pub fn validate(&self) -> EngineResult<()> {
        if self.failure_policy == DagFailurePolicy::Retry && self.max_retries == 0 {
            return Err(EngineError::InvalidArgument(
                "retry failure policy requires max_retries > 0".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for DagConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagConfig")
            .field("failure_policy", &self.failure_policy)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("detect_cycles", &self.detect_cycles)
            .field("execute_in_parallel", &self.execute_in_parallel)
            .finish()
    }
}

/// Point-in-time execution statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DagStats {
    /// Nodes in the graph
    pub total_jobs: usize,
    /// Completed nodes
    pub completed_jobs: usize,
    /// Failed nodes
    pub failed_jobs: usize,
    /// Pending nodes
    pub pending_jobs: usize,
    /// Ready nodes
    pub ready_jobs: usize,
    /// Running nodes
    pub running_jobs: usize,
    /// Skipped nodes
    pub skipped_jobs: usize,
    /// Cancelled nodes
    pub cancelled_jobs: usize,
    /// Wall-clock time of the last (or current) execution
    pub total_execution_time: Duration,
    /// Longest chain of completed nodes by execution time
    pub critical_path_time: Duration,
    /// Summed node execution time over wall time, clamped to worker count
    pub parallelism_efficiency: f64,
}

impl DagStats {
    /// Whether no node remains schedulable or running
    pub fn is_complete(&self) -> bool {
        self.pending_jobs == 0 && self.ready_jobs == 0 && self.running_jobs == 0
    }

    /// Whether every node completed successfully
    pub fn all_succeeded(&self) -> bool {
        self.is_complete()
            && self.failed_jobs == 0
            && self.cancelled_jobs == 0
            && self.skipped_jobs == 0
    }

    /// Completed over total, 0.0 for an empty graph
    pub fn success_rate(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        self.completed_jobs as f64 / self.total_jobs as f64
    }
}
