use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::batch::JobId;

/// Why a job ended up failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The processor returned an error (or panicked) for this job
    ProcessingError,
    /// The job's worker exceeded its deadline
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProcessingError => "processing_error",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: JobId,

    pub succeeded: bool,

    /// Processor output (opaque to the orchestrator)
    pub output: Option<String>,

    /// Wall-clock time spent in the processor; zero for synthesized timeouts
    pub processing_time_ms: u64,

    pub error_kind: Option<ErrorKind>,

    pub error_message: Option<String>,

    /// Number of times the processor was invoked for this job
    pub attempts: u32,

    /// Whether this result came out of the retry pass
    pub retried: bool,
}

impl ExecutionResult {
    pub fn success(job_id: JobId, output: String, elapsed: Duration) -> Self {
        Self {
            job_id,
            succeeded: true,
            output: Some(output),
            processing_time_ms: elapsed.as_millis() as u64,
            error_kind: None,
            error_message: None,
            attempts: 1,
            retried: false,
        }
    }

    pub fn processing_error(job_id: JobId, message: String, elapsed: Duration) -> Self {
        Self {
            job_id,
            succeeded: false,
            output: None,
            processing_time_ms: elapsed.as_millis() as u64,
            error_kind: Some(ErrorKind::ProcessingError),
            error_message: Some(message),
            attempts: 1,
            retried: false,
        }
    }

    /// Record synthesized for a job whose worker was terminated at its deadline.
    /// Whether the job actually ran is unknown, so no time is attributed to it.
    pub fn timeout(job_id: JobId, deadline: Duration) -> Self {
        Self {
            job_id,
            succeeded: false,
            output: None,
            processing_time_ms: 0,
            error_kind: Some(ErrorKind::Timeout),
            error_message: Some(format!(
                "worker exceeded its {}ms deadline",
                deadline.as_millis()
            )),
            attempts: 1,
            retried: false,
        }
    }
}

/// Aggregate report of one complete orchestration run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_jobs: usize,

    /// Succeeded during the parallel phase
    pub originally_succeeded: usize,

    /// Failed during the parallel phase (any kind)
    pub originally_failed: usize,

    /// Subset of `originally_failed` that failed by deadline
    pub timed_out: usize,

    /// Failed in the parallel phase, succeeded in the retry pass
    pub recovered_by_retry: usize,

    /// Jobs whose terminal result is a failure
    pub still_failed: usize,

    pub succeeded: usize,

    pub failed: usize,

    /// Processing time summed over jobs that ultimately succeeded
    pub total_processing_ms: u64,

    /// Mean processing time over jobs that ultimately succeeded
    pub average_processing_ms: f64,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Wall-clock duration of the whole run
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// Build the summary from the parallel-phase results and the terminal results.
    /// Both slices must hold exactly one entry per job.
    pub fn compute(
        parallel: &[ExecutionResult],
        terminal: &[ExecutionResult],
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();

        let originally_failed = parallel.iter().filter(|r| !r.succeeded).count();
        let timed_out = parallel
            .iter()
            .filter(|r| r.error_kind == Some(ErrorKind::Timeout))
            .count();
        let recovered_by_retry = terminal
            .iter()
            .filter(|r| r.retried && r.succeeded)
            .count();

        let successes: Vec<&ExecutionResult> = terminal.iter().filter(|r| r.succeeded).collect();
        let total_processing_ms: u64 = successes.iter().map(|r| r.processing_time_ms).sum();
        let average_processing_ms = if successes.is_empty() {
            0.0
        } else {
            total_processing_ms as f64 / successes.len() as f64
        };

        let failed = terminal.len() - successes.len();

        Self {
            total_jobs: terminal.len(),
            originally_succeeded: parallel.len() - originally_failed,
            originally_failed,
            timed_out,
            recovered_by_retry,
            still_failed: failed,
            succeeded: successes.len(),
            failed,
            total_processing_ms,
            average_processing_ms,
            started_at: Some(started_at),
            finished_at: Some(finished_at),
            elapsed_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}
