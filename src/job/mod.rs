//! Job composition model
//!
//! A [`Job`] is one unit of work: a stable 64-bit id, an optional name, an
//! optional binary payload, and a work function returning [`VoidResult`].
//! Orthogonal behaviors (completion/error callbacks, retry policy,
//! cancellation token, timeout, priority) attach through a single
//! lazily-allocated [`JobComponents`] record instead of a subclass hierarchy,
//! so a bare job pays for nothing it does not use.

pub mod builder;
pub mod cancellation;
pub mod retry;

pub use builder::JobBuilder;
pub use cancellation::CancellationToken;
pub use retry::{RetryPolicy, RetryStrategy};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, VoidResult};

/// Priority levels for job scheduling
///
/// Priority is a decorator consulted by policies and schedulers; the FIFO
/// backpressure queue itself does not reorder by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobPriority {
    /// Executed when nothing else is pending
    Lowest,
    /// Background tasks
    Low,
    /// Default for most jobs
    Normal,
    /// Time-sensitive tasks
    High,
    /// Critical tasks
    Highest,
    /// Use sparingly
    Realtime,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

/// Work function executed on a worker thread
///
/// `Fn` (not `FnOnce`) because an attached retry policy may re-execute the
/// same job.
pub type WorkFn = Box<dyn Fn() -> VoidResult + Send>;

/// Completion callback receiving the execution result
pub type CompleteFn = Box<dyn Fn(&VoidResult) + Send>;

/// Error callback receiving the failure
pub type ErrorFn = Box<dyn Fn(&EngineError) + Send>;

/// Composed behaviors attached to a job
///
/// Allocated on first use; a job with no decorators carries only a null
/// pointer for this record.
#[derive(Default)]
pub struct JobComponents {
    /// Invoked after execution, success or failure
    pub on_complete: Option<CompleteFn>,
    /// Invoked only on failure
    pub on_error: Option<ErrorFn>,
    /// Scheduling priority override
    pub priority: Option<JobPriority>,
    /// Automatic retry on retryable failure
    pub retry: Option<RetryPolicy>,
    /// Cooperative cancellation signal
    pub cancellation: Option<CancellationToken>,
    /// Advisory execution deadline
    pub timeout: Option<Duration>,
}

impl JobComponents {
    fn is_empty(&self) -> bool {
        self.on_complete.is_none()
            && self.on_error.is_none()
            && self.priority.is_none()
            && self.retry.is_none()
            && self.cancellation.is_none()
            && self.timeout.is_none()
    }
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_job_id() -> u64 {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

/// One unit of work
pub struct Job {
    id: u64,
    name: String,
    payload: Option<Arc<[u8]>>,
    work: WorkFn,
    components: Option<Box<JobComponents>>,
    created_at: Instant,
}

impl Job {
    /// Create a job from a name and work function
    ///
    /// Prefer [`JobBuilder`] when attaching decorators.
    pub fn new(name: impl Into<String>, work: WorkFn) -> Self {
        Self {
            id: next_job_id(),
            name: name.into(),
            payload: None,
            work,
            components: None,
            created_at: Instant::now(),
        }
    }

    pub(crate) fn with_parts(
        name: String,
        payload: Option<Arc<[u8]>>,
        work: WorkFn,
        components: Option<Box<JobComponents>>,
    ) -> Self {
        // Empty component records are not kept alive.
        let components = components.filter(|c| !c.is_empty());
        Self {
            id: next_job_id(),
            name,
            payload,
            work,
            components,
            created_at: Instant::now(),
        }
    }

    /// Unique, monotonic job id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binary payload, if one was attached
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// When the job was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Effective priority (`Normal` when unset)
    pub fn priority(&self) -> JobPriority {
        self.components
            .as_ref()
            .and_then(|c| c.priority)
            .unwrap_or_default()
    }

    /// Attached retry policy, if any
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.components.as_ref().and_then(|c| c.retry.as_ref())
    }

    /// Mutable access to the retry policy for attempt accounting
    pub fn retry_policy_mut(&mut self) -> Option<&mut RetryPolicy> {
        self.components.as_mut().and_then(|c| c.retry.as_mut())
    }

    /// Attached cancellation token, if any
    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.components
            .as_ref()
            .and_then(|c| c.cancellation.as_ref())
    }

    /// Advisory timeout, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.components.as_ref().and_then(|c| c.timeout)
    }

    /// Whether any decorator is attached
    pub fn has_components(&self) -> bool {
        self.components.is_some()
    }

    /// Whether the attached token (if any) has tripped
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    pub(crate) fn ensure_components(&mut self) -> &mut JobComponents {
        self.components
            .get_or_insert_with(|| Box::new(JobComponents::default()))
    }

    /// Attach a completion callback
    pub fn with_on_complete(mut self, callback: CompleteFn) -> Self {
        self.ensure_components().on_complete = Some(callback);
        self
    }

    /// Attach an error callback
    pub fn with_on_error(mut self, callback: ErrorFn) -> Self {
        self.ensure_components().on_error = Some(callback);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.ensure_components().priority = Some(priority);
        self
    }

    /// Attach a cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.ensure_components().cancellation = Some(token);
        self
    }

    /// Attach a retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.ensure_components().retry = Some(policy);
        self
    }

    /// Set an advisory timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.ensure_components().timeout = Some(timeout);
        self
    }

    /// Execute the job's work and fire callbacks
    ///
    /// If the cancellation token is already tripped the work is skipped and
    /// an `OperationCanceled` error flows through the callbacks. A panic in
    /// the work function is caught and converted to `JobExecutionFailed`,
    /// so user code never unwinds into pool-owned threads.
    pub fn execute(&mut self) -> VoidResult {
        let result = if self.is_cancelled() {
            Err(EngineError::OperationCanceled(format!(
                "job '{}' cancelled before execution",
                self.name
            )))
        } else {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (self.work)())) {
                Ok(result) => result,
                Err(panic) => Err(EngineError::JobExecutionFailed(format!(
                    "job '{}' panicked: {}",
                    self.name,
                    panic_message(panic.as_ref())
                ))),
            }
        };

        self.invoke_callbacks(&result);
        result
    }

    /// Fire `on_complete` and, on failure, `on_error`
    fn invoke_callbacks(&self, result: &VoidResult) {
        if let Some(components) = self.components.as_ref() {
            if let Some(on_complete) = components.on_complete.as_ref() {
                on_complete(result);
            }
            if let Err(err) = result {
                if let Some(on_error) = components.on_error.as_ref() {
                    on_error(err);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority())
            .field("has_components", &self.has_components())
            .finish()
    }
}
