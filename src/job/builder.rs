//! Fluent builder for composed jobs
//!
//! Replaces a subclass hierarchy (cancellable job, callback job, protected
//! job, ...) with one builder that accumulates decorators and produces a
//! single [`Job`] value. Decorators are stored in one lazily-allocated
//! record, so a job built with none of them carries no extra allocation.
//!
//! ```
//! use gantry::job::{JobBuilder, RetryPolicy};
//! use std::time::Duration;
//!
//! let job = JobBuilder::new()
//!     .name("fetch")
//!     .work(|| Ok(()))
//!     .retry(RetryPolicy::exponential_backoff(3))
//!     .timeout(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//! assert_eq!(job.name(), "fetch");
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult, VoidResult};
use crate::job::cancellation::CancellationToken;
use crate::job::retry::RetryPolicy;
use crate::job::{CompleteFn, ErrorFn, Job, JobComponents, JobPriority, WorkFn};

/// Fluent builder producing a [`Job`]
///
/// The builder is not thread-safe during construction; the resulting job is
/// safe to submit to any queue. Exactly one work source must be supplied:
/// [`work`](JobBuilder::work), [`work_with_payload`](JobBuilder::work_with_payload),
/// or [`from_fn`](JobBuilder::from_fn).
#[derive(Default)]
pub struct JobBuilder {
    name: Option<String>,
    work: Option<WorkFn>,
    payload: Option<Arc<[u8]>>,
    components: Option<Box<JobComponents>>,
    factory: Option<Box<dyn FnOnce() -> EngineResult<Job> + Send>>,
}

impl JobBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the work function
    pub fn work<F>(mut self, work_fn: F) -> Self
    where
        F: Fn() -> VoidResult + Send + 'static,
    {
        self.work = Some(Box::new(work_fn));
        self
    }

    /// Set a binary payload and a work function that consumes it
    ///
    /// The payload is also retained on the job for inspection via
    /// [`Job::payload`].
    pub fn work_with_payload<F>(mut self, payload: Vec<u8>, work_fn: F) -> Self
    where
        F: Fn(&[u8]) -> VoidResult + Send + 'static,
    {
        let shared: Arc<[u8]> = payload.into();
        let captured = shared.clone();
        self.payload = Some(shared);
        self.work = Some(Box::new(move || work_fn(&captured)));
        self
    }

    /// Produce the job from a factory closure instead of a work function
    ///
    /// Lets callers construct a custom job value (for example, one built by
    /// another subsystem) while still flowing through builder validation.
    /// Decorators set on this builder are applied on top of the factory's
    /// job.
    pub fn from_fn<F>(mut self, factory: F) -> Self
    where
        F: FnOnce() -> EngineResult<Job> + Send + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Attach a cancellation token
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.ensure_components().cancellation = Some(token);
        self
    }

    /// Attach a completion callback
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&VoidResult) + Send + 'static,
    {
        self.ensure_components().on_complete = Some(Box::new(callback) as CompleteFn);
        self
    }

    /// Attach an error callback
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&EngineError) + Send + 'static,
    {
        self.ensure_components().on_error = Some(Box::new(callback) as ErrorFn);
        self
    }

    /// Set the priority
    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.ensure_components().priority = Some(priority);
        self
    }

    /// Attach a retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.ensure_components().retry = Some(policy);
        self
    }

    /// Set an advisory timeout
    ///
    /// The pool's deadline watchdog trips the job's cancellation token when
    /// the timeout elapses mid-execution, so a token is attached implicitly
    /// if none was supplied.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let components = self.ensure_components();
        components.timeout = Some(timeout);
        if components.cancellation.is_none() {
            components.cancellation = Some(CancellationToken::new());
        }
        self
    }

    fn ensure_components(&mut self) -> &mut JobComponents {
        self.components
            .get_or_insert_with(|| Box::new(JobComponents::default()))
    }

    /// Build the job
    ///
    /// Fails with `JobCreationFailed` when no work source was supplied.
    pub fn build(self) -> EngineResult<Job> {
        if let Some(factory) = self.factory {
            let mut job = factory()?;
            if let Some(components) = self.components {
                let target = job.ensure_components();
                if components.on_complete.is_some() {
                    target.on_complete = components.on_complete;
                }
                if components.on_error.is_some() {
                    target.on_error = components.on_error;
                }
                if components.priority.is_some() {
                    target.priority = components.priority;
                }
                if components.retry.is_some() {
                    target.retry = components.retry;
                }
                if components.cancellation.is_some() {
                    target.cancellation = components.cancellation;
                }
                if components.timeout.is_some() {
                    target.timeout = components.timeout;
                }
            }
            return Ok(job);
        }

        let work = self.work.ok_or_else(|| {
            EngineError::JobCreationFailed("no work function supplied".into())
        })?;

        Ok(Job::with_parts(
            self.name.unwrap_or_else(|| "job".into()),
            self.payload,
            work,
            self.components,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_build_requires_work() {
        let result = JobBuilder::new().name("empty").build();
        assert!(matches!(result, Err(EngineError::JobCreationFailed(_))));
    }

    #[test]
    fn test_default_name() {
        let job = JobBuilder::new().work(|| Ok(())).build().unwrap();
        assert_eq!(job.name(), "job");
    }

    #[test]
    fn test_decorators_are_attached() {
        let token = CancellationToken::new();
        let job = JobBuilder::new()
            .name("decorated")
            .work(|| Ok(()))
            .cancellation(token.clone())
            .priority(JobPriority::High)
            .retry(RetryPolicy::fixed(2, Duration::from_millis(5)))
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();

        assert_eq!(job.priority(), JobPriority::High);
        assert!(job.retry_policy().is_some());
        assert_eq!(job.timeout(), Some(Duration::from_secs(1)));
        assert!(job.cancellation_token().is_some());

        token.cancel();
        assert!(job.is_cancelled());
    }

    #[test]
    fn test_timeout_implies_cancellation_token() {
        let job = JobBuilder::new()
            .work(|| Ok(()))
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        assert!(job.cancellation_token().is_some());
    }

    #[test]
    fn test_factory_jobs_receive_decorators() {
        let job = JobBuilder::new()
            .from_fn(|| Ok(Job::new("custom", Box::new(|| Ok(())))))
            .priority(JobPriority::Realtime)
            .build()
            .unwrap();

        assert_eq!(job.name(), "custom");
        assert_eq!(job.priority(), JobPriority::Realtime);
    }

    #[test]
    fn test_built_job_executes_work() {
        let counter = std::sync::Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let mut job = JobBuilder::new()
            .work(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();

        assert!(job.execute().is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
