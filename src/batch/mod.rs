use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque job identifier (a media path, an object key, a video id...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One unit of work submitted to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Job {
    pub id: JobId,
}

impl Job {
    pub fn new(id: impl Into<JobId>) -> Self {
        Self { id: id.into() }
    }
}

/// An ordered, read-only group of jobs handed to exactly one worker slot at a time.
///
/// The job list sits behind an `Arc` so the coordinator, the supervisor and the
/// worker can all hold the same batch without copying it.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position of this batch in the partition
    pub index: usize,

    jobs: Arc<[Job]>,
}

impl Batch {
    pub fn new(index: usize, jobs: Vec<Job>) -> Self {
        Self {
            index,
            jobs: jobs.into(),
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Split `jobs` into `ceil(N / batch_size)` ordered batches.
///
/// Every job lands in exactly one batch and relative order is preserved; only the
/// last batch may be shorter than `batch_size`. A `batch_size` of zero is rejected.
pub fn partition(jobs: &[Job], batch_size: usize) -> crate::Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(crate::OrchestratorError::InvalidConfig(
            "batch size must be at least 1".to_string(),
        )
        .into());
    }

    Ok(jobs
        .chunks(batch_size)
        .enumerate()
        .map(|(index, chunk)| Batch::new(index, chunk.to_vec()))
        .collect())
}
