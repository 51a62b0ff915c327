//! Error taxonomy for the engine
//!
//! Every fallible operation in the crate returns [`EngineResult`] with a flat
//! [`EngineError`] discriminant carrying an optional free-text message.
//! Errors raised by user code inside a job are caught at the worker boundary
//! and converted to [`EngineError::JobExecutionFailed`]; they never cross the
//! pool boundary as panics.

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for operations without a value (job work functions, policies)
pub type VoidResult = EngineResult<()>;

/// Flat error taxonomy for the engine
///
/// Variants are grouped by subsystem: general, worker threads, queue, job,
/// resources, synchronization, circuit breaker, and DAG.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    // General
    /// Unclassified failure
    #[error("unknown error: {0}")]
    Unknown(String),

    /// Operation was cancelled through a cancellation token
    #[error("operation canceled: {0}")]
    OperationCanceled(String),

    /// Operation exceeded its deadline
    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// Requested behavior is not implemented
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Caller supplied an invalid argument or configuration
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Worker threads
    /// The pool (or a worker) is already running
    #[error("already running: {0}")]
    AlreadyRunning(String),

    /// The pool (or a worker) is not running
    #[error("not running: {0}")]
    NotRunning(String),

    /// OS thread creation failed
    #[error("thread start failure: {0}")]
    ThreadStartFailure(String),

    /// Worker thread could not be joined
    #[error("thread join failure: {0}")]
    ThreadJoinFailure(String),

    // Queue
    /// Bounded queue is at capacity and the job was not admitted
    #[error("queue is full: {0}")]
    QueueFull(String),

    /// Queue holds no jobs (non-blocking dequeue)
    #[error("queue is empty")]
    QueueEmpty,

    /// Queue has been stopped; no further operations are served
    #[error("queue is stopped")]
    QueueStopped,

    /// Token-bucket rate limiter refused the job
    #[error("rate limited: {0}")]
    RateLimited(String),

    // Job
    /// Job could not be constructed
    #[error("job creation failed: {0}")]
    JobCreationFailed(String),

    /// Job work returned an error or panicked
    #[error("job execution failed: {0}")]
    JobExecutionFailed(String),

    /// Job is malformed (e.g. missing work function)
    #[error("invalid job: {0}")]
    JobInvalid(String),

    // Resources
    /// A resource (memory, handle) could not be allocated
    #[error("resource allocation failed: {0}")]
    ResourceAllocationFailed(String),

    /// A configured resource limit was reached
    #[error("resource limit reached: {0}")]
    ResourceLimitReached(String),

    // Synchronization
    /// Mutex acquisition failed
    #[error("mutex error: {0}")]
    MutexError(String),

    /// A deadlock was detected
    #[error("deadlock detected: {0}")]
    DeadlockDetected(String),

    /// Condition-variable wait failed
    #[error("condition variable error: {0}")]
    CondvarError(String),

    // Circuit breaker
    /// Circuit is open; the request was rejected without running
    #[error("circuit is open")]
    CircuitOpen,

    /// Circuit is half-open and its probe budget is exhausted
    #[error("circuit half-open probe limit reached")]
    CircuitHalfOpenSaturated,

    // DAG
    /// Adding the dependency would create a cycle
    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),

    /// Referenced DAG job does not exist in the graph
    #[error("unknown dag job: {0}")]
    UnknownDagJob(u64),

    /// DAG job cannot be removed or reset while running
    #[error("dag job is running: {0}")]
    DagJobRunning(u64),
}

impl EngineError {
    /// Whether a retry policy may re-execute a job that failed with this error
    ///
    /// Cancellations, invalid input, and structural DAG errors are terminal;
    /// execution failures, timeouts, and transient resource/queue pressure
    /// are retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::JobExecutionFailed(_)
                | EngineError::OperationTimeout(_)
                | EngineError::ResourceAllocationFailed(_)
                | EngineError::ResourceLimitReached(_)
                | EngineError::QueueFull(_)
                | EngineError::RateLimited(_)
                | EngineError::Unknown(_)
        )
    }

    /// Whether this error represents a cooperative cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::OperationCanceled(_))
    }

    /// Short stable name for event payloads and logs
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Unknown(_) => "unknown",
            EngineError::OperationCanceled(_) => "operation_canceled",
            EngineError::OperationTimeout(_) => "operation_timeout",
            EngineError::NotImplemented(_) => "not_implemented",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::AlreadyRunning(_) => "already_running",
            EngineError::NotRunning(_) => "not_running",
            EngineError::ThreadStartFailure(_) => "thread_start_failure",
            EngineError::ThreadJoinFailure(_) => "thread_join_failure",
            EngineError::QueueFull(_) => "queue_full",
            EngineError::QueueEmpty => "queue_empty",
            EngineError::QueueStopped => "queue_stopped",
            EngineError::RateLimited(_) => "rate_limited",
            EngineError::JobCreationFailed(_) => "job_creation_failed",
            EngineError::JobExecutionFailed(_) => "job_execution_failed",
            EngineError::JobInvalid(_) => "job_invalid",
            EngineError::ResourceAllocationFailed(_) => "resource_allocation_failed",
            EngineError::ResourceLimitReached(_) => "resource_limit_reached",
            EngineError::MutexError(_) => "mutex_error",
            EngineError::DeadlockDetected(_) => "deadlock_detected",
            EngineError::CondvarError(_) => "condition_variable_error",
            EngineError::CircuitOpen => "circuit_open",
            EngineError::CircuitHalfOpenSaturated => "circuit_half_open_full",
            EngineError::CycleDetected(_) => "dag_cycle_detected",
            EngineError::UnknownDagJob(_) => "dag_unknown_job",
            EngineError::DagJobRunning(_) => "dag_job_running",
        }
    }
}
