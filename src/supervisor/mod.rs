use std::collections::HashMap;
use std::fmt::Display;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::batch::{Batch, JobId};
use crate::config::ReportingMode;
use crate::summary::ExecutionResult;
use crate::worker::{self, JobProcessor, SlotId};

/// How a dispatched batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The worker reported before its deadline
    Completed,
    /// The deadline fired and the worker was terminated
    TimedOut,
    /// The worker task died without reporting
    Crashed,
}

/// The single message a supervised slot sends back to the pool
#[derive(Debug)]
pub struct SlotReport {
    pub slot: SlotId,
    pub batch_index: usize,
    pub outcome: SlotOutcome,
    /// Exactly one result per job of the batch
    pub results: Vec<ExecutionResult>,
}

/// Owned handle to a spawned task; the task is aborted when the handle is dropped.
///
/// A plain `JoinHandle` only detaches on drop, which would leave workers (and any
/// child process they started) running after the pool that owns them is gone.
#[derive(Debug)]
#[must_use = "dropping the handle aborts the task"]
pub struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Deref for AbortOnDrop<T> {
    type Target = JoinHandle<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for AbortOnDrop<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Arms a deadline around every dispatched batch and terminates workers that overrun it
#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    deadline: Duration,
    reporting: ReportingMode,
}

impl TimeoutSupervisor {
    pub fn new(deadline: Duration, reporting: ReportingMode) -> Self {
        Self { deadline, reporting }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Start a fresh worker for `batch` in `slot`, guarded by the deadline.
    ///
    /// Exactly one [`SlotReport`] is sent on `reports` per dispatch, whatever happens
    /// to the worker, unless the returned handle is dropped first: that aborts the
    /// supervisor and its worker.
    pub fn dispatch(
        &self,
        slot: SlotId,
        batch: Batch,
        processor: Arc<dyn JobProcessor>,
        reports: UnboundedSender<SlotReport>,
    ) -> AbortOnDrop<()> {
        let supervisor = self.clone();
        AbortOnDrop::new(tokio::spawn(async move {
            let report = supervisor.supervise(slot, batch, processor).await;
            if reports.send(report).is_err() {
                tracing::error!(slot, "Pool stopped listening before slot reported");
            }
        }))
    }

    async fn supervise(
        &self,
        slot: SlotId,
        batch: Batch,
        processor: Arc<dyn JobProcessor>,
    ) -> SlotReport {
        let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
        let stream_tx = (self.reporting == ReportingMode::Streaming).then_some(stream_tx);

        let mut worker = AbortOnDrop::new(tokio::spawn(worker::run_batch(
            slot,
            batch.clone(),
            processor,
            stream_tx,
        )));

        match tokio::time::timeout(self.deadline, &mut *worker).await {
            Ok(Ok(results)) => SlotReport {
                slot,
                batch_index: batch.index,
                outcome: SlotOutcome::Completed,
                results,
            },
            Ok(Err(join_error)) => crashed(slot, &batch, &mut stream_rx, join_error),
            Err(_) => {
                worker.abort();
                let finished = drain(&mut stream_rx);
                tracing::warn!(
                    slot,
                    batch = batch.index,
                    jobs = batch.len(),
                    kept = finished.len(),
                    deadline_ms = self.deadline.as_millis() as u64,
                    "Worker exceeded deadline, terminated"
                );
                let deadline = self.deadline;
                let results = fill_missing(&batch, finished, |id| ExecutionResult::timeout(id, deadline));
                SlotReport {
                    slot,
                    batch_index: batch.index,
                    outcome: SlotOutcome::TimedOut,
                    results,
                }
            }
        }
    }
}

/// Report for a worker that died without reporting: streamed results are kept, every
/// other job of the batch becomes a `processing_error`
fn crashed(
    slot: SlotId,
    batch: &Batch,
    stream: &mut mpsc::UnboundedReceiver<ExecutionResult>,
    reason: impl Display,
) -> SlotReport {
    tracing::error!(slot, batch = batch.index, error = %reason, "Worker died without reporting");
    let finished = drain(stream);
    let message = format!("worker terminated unexpectedly: {}", reason);
    let results = fill_missing(batch, finished, |id| {
        ExecutionResult::processing_error(id, message.clone(), Duration::ZERO)
    });
    SlotReport {
        slot,
        batch_index: batch.index,
        outcome: SlotOutcome::Crashed,
        results,
    }
}

fn drain(stream: &mut mpsc::UnboundedReceiver<ExecutionResult>) -> HashMap<JobId, ExecutionResult> {
    let mut finished = HashMap::new();
    while let Ok(result) = stream.try_recv() {
        finished.entry(result.job_id.clone()).or_insert(result);
    }
    finished
}

/// One result per job of `batch`: streamed results where present, synthesized otherwise
fn fill_missing(
    batch: &Batch,
    mut finished: HashMap<JobId, ExecutionResult>,
    synthesize: impl Fn(JobId) -> ExecutionResult,
) -> Vec<ExecutionResult> {
    batch
        .jobs()
        .iter()
        .map(|job| {
            finished
                .remove(&job.id)
                .unwrap_or_else(|| synthesize(job.id.clone()))
        })
        .collect()
}
