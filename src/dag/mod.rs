//! DAG scheduling: dependency graphs of jobs executed on a worker pool

pub mod config;
pub mod export;
pub mod job;
pub mod scheduler;

pub use config::{DagConfig, DagFailurePolicy, DagStats};
pub use export::{DagDump, DagDumpEdge, DagDumpNode};
pub use job::{DagJob, DagJobId, DagJobInfo, DagJobState, INVALID_DAG_JOB_ID};
pub use scheduler::{DagScheduler, ExecutionHandle};
