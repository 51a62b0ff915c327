//! Concurrent job execution engine
//!
//! A library for servers that must accept bursty load, run heterogeneous
//! tasks, recover from failures, and stay responsive under saturation:
//! - Bounded job queue with watermark-driven backpressure, overflow
//!   policies, and token-bucket rate limiting
//! - Worker pool with composable policies and optional work stealing
//!   (per-worker deques, pluggable victim selection, batch stealing)
//! - DAG scheduler with cycle detection, failure policies, and result
//!   passing between nodes
//! - Circuit breaker with a sliding failure window
//! - Jobs that compose callbacks, retry, cancellation, timeout, and
//!   priority as orthogonal decorators
//!
//! The engine runs on plain OS threads and owns no async runtime; it emits
//! structured [`events`] for an external logging layer and mirrors them
//! through `tracing`.
//!
//! ```no_run
//! use gantry::job::JobBuilder;
//! use gantry::pool::{PoolConfig, WorkerPool};
//!
//! let pool = WorkerPool::new("app", PoolConfig::default()).unwrap();
//! pool.start().unwrap();
//!
//! let job = JobBuilder::new()
//!     .name("greet")
//!     .work(|| {
//!         println!("hello from a worker");
//!         Ok(())
//!     })
//!     .build()
//!     .unwrap();
//! pool.submit(job).unwrap();
//!
//! pool.stop(false).unwrap();
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod breaker;
pub mod config;
pub mod dag;
pub mod error;
pub mod events;
pub mod job;
pub mod pool;
pub mod queue;
pub mod stealing;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, FailureWindow};
pub use config::EngineConfig;
pub use dag::{DagConfig, DagFailurePolicy, DagJob, DagJobState, DagScheduler};
pub use error::{EngineError, EngineResult, VoidResult};
pub use events::{EngineEvent, EventSink, NullSink};
pub use job::{CancellationToken, Job, JobBuilder, JobPriority, RetryPolicy};
pub use pool::{CircuitBreakerPolicy, PoolConfig, PoolPolicy, WorkerPool};
pub use queue::{BackpressureConfig, BackpressurePolicy, BackpressureQueue, PressureLevel};
pub use stealing::{VictimSelection, WorkStealingConfig};
