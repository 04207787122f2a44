//! Batch Transcriptor - parallel orchestration of long-running transcription jobs
//!
//! This library fans a list of opaque jobs out across a bounded pool of worker slots,
//! enforces a wall-clock deadline per dispatched batch, and runs a sequential recovery
//! pass over whatever failed. The actual work (downloading, transcribing, uploading
//! captions) is plugged in through the [`JobProcessor`] trait.

pub mod batch;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod output;
pub mod pool;
pub mod processors;
pub mod retry;
pub mod summary;
pub mod supervisor;
pub mod utils;
pub mod worker;

pub use batch::{partition, Batch, Job, JobId};
pub use config::{Config, OrchestratorConfig, ReportingMode, RetryConfig};
pub use orchestrator::{run_batch_jobs, RunReport};
pub use retry::BackoffPolicy;
pub use summary::{ErrorKind, ExecutionResult, RunSummary};
pub use worker::{processor_fn, JobProcessor};

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Fatal orchestration errors. Job-level failures never surface here; they are
/// recorded as [`ExecutionResult`]s instead.
#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    #[error("Internal invariant violation for job {job_id}: {detail}")]
    InvariantViolation { job_id: String, detail: String },

    #[error("Worker report channel closed with {active} slot(s) still active")]
    WorkerLost { active: usize },
}
