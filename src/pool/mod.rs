use indicatif::ProgressBar;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::batch::Batch;
use crate::summary::ExecutionResult;
use crate::supervisor::{AbortOnDrop, SlotOutcome, SlotReport, TimeoutSupervisor};
use crate::worker::{JobProcessor, SlotId};
use crate::OrchestratorError;

/// Bounded pool of worker slots driving a set of batches to completion
pub struct WorkerPool {
    pool_size: usize,
    supervisor: TimeoutSupervisor,
    processor: Arc<dyn JobProcessor>,
    progress: ProgressBar,
}

/// A slot currently running a batch
struct ActiveSlot {
    batch_index: usize,
    jobs: usize,
    dispatched_at: Instant,
    /// Supervisor task holding the deadline; dropping it aborts the batch
    _task: AbortOnDrop<()>,
}

/// Coordinator-owned bookkeeping; only `WorkerPool::run` touches it
struct PoolState {
    pending: VecDeque<Batch>,
    idle: VecDeque<SlotId>,
    active: HashMap<SlotId, ActiveSlot>,
    results: Vec<ExecutionResult>,
    timed_out_batches: usize,
}

impl PoolState {
    fn new(batches: Vec<Batch>, pool_size: usize) -> Self {
        let slots = pool_size.min(batches.len());
        Self {
            pending: batches.into(),
            idle: (0..slots).collect(),
            active: HashMap::with_capacity(slots),
            results: Vec::new(),
            timed_out_batches: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }
}

impl WorkerPool {
    pub fn new(pool_size: usize, supervisor: TimeoutSupervisor, processor: Arc<dyn JobProcessor>) -> Self {
        Self {
            pool_size: pool_size.max(1),
            supervisor,
            processor,
            progress: ProgressBar::hidden(),
        }
    }

    /// Report per-job progress on `progress` (incremented as slots report)
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Run every batch through the pool and return all results once no slot is active.
    ///
    /// Result order is not significant; callers match results by job id. If this
    /// returns early or the future is dropped, every active slot is aborted.
    pub async fn run(&self, batches: Vec<Batch>) -> crate::Result<Vec<ExecutionResult>> {
        let total_batches = batches.len();
        let total_jobs: usize = batches.iter().map(Batch::len).sum();
        let mut state = PoolState::new(batches, self.pool_size);

        tracing::info!(
            batches = total_batches,
            jobs = total_jobs,
            slots = state.idle.len(),
            deadline_ms = self.supervisor.deadline().as_millis() as u64,
            "Starting parallel phase"
        );

        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel::<SlotReport>();
        self.drive(&mut state, &mut reports_rx, Some(reports_tx)).await?;

        tracing::info!(
            results = state.results.len(),
            timed_out_batches = state.timed_out_batches,
            "Parallel phase finished"
        );

        Ok(state.results)
    }

    /// Event loop: dispatch, wait for a report, free the slot, repeat until done
    async fn drive(
        &self,
        state: &mut PoolState,
        reports_rx: &mut UnboundedReceiver<SlotReport>,
        mut reports_tx: Option<UnboundedSender<SlotReport>>,
    ) -> crate::Result<()> {
        self.fill_idle_slots(state, &mut reports_tx);

        while !state.is_done() {
            let report = match reports_rx.recv().await {
                Some(report) => report,
                None => {
                    return Err(OrchestratorError::WorkerLost {
                        active: state.active.len(),
                    }
                    .into())
                }
            };

            self.complete(state, report)?;
            self.fill_idle_slots(state, &mut reports_tx);
        }

        Ok(())
    }

    /// Dispatch pending batches into idle slots until one side runs out
    fn fill_idle_slots(&self, state: &mut PoolState, reports: &mut Option<UnboundedSender<SlotReport>>) {
        while let Some(tx) = reports.as_ref() {
            if state.pending.is_empty() || state.idle.is_empty() {
                break;
            }
            let (Some(slot), Some(batch)) = (state.idle.pop_front(), state.pending.pop_front()) else {
                break;
            };

            tracing::debug!(slot, batch = batch.index, jobs = batch.len(), "Dispatching batch");

            let active = ActiveSlot {
                batch_index: batch.index,
                jobs: batch.len(),
                dispatched_at: Instant::now(),
                _task: self
                    .supervisor
                    .dispatch(slot, batch, self.processor.clone(), tx.clone()),
            };
            state.active.insert(slot, active);
            debug_assert!(state.active.len() <= self.pool_size);
        }

        // Once nothing is left to dispatch, only the supervisors hold senders, so a
        // supervisor vanishing without reporting closes the channel instead of hanging.
        if state.pending.is_empty() {
            reports.take();
        }
    }

    fn complete(&self, state: &mut PoolState, report: SlotReport) -> crate::Result<()> {
        let active = state.active.remove(&report.slot).ok_or_else(|| {
            OrchestratorError::InvariantViolation {
                job_id: format!("<slot {}>", report.slot),
                detail: "report received from a slot with no active batch".to_string(),
            }
        })?;

        if active.batch_index != report.batch_index || active.jobs != report.results.len() {
            return Err(OrchestratorError::InvariantViolation {
                job_id: format!("<batch {}>", report.batch_index),
                detail: format!(
                    "slot {} reported {} result(s) for batch {}, expected {} for batch {}",
                    report.slot,
                    report.results.len(),
                    report.batch_index,
                    active.jobs,
                    active.batch_index
                ),
            }
            .into());
        }

        let elapsed_ms = active.dispatched_at.elapsed().as_millis() as u64;
        match report.outcome {
            SlotOutcome::Completed => {
                tracing::debug!(slot = report.slot, batch = report.batch_index, elapsed_ms, "Batch completed");
            }
            SlotOutcome::TimedOut => {
                state.timed_out_batches += 1;
                tracing::warn!(slot = report.slot, batch = report.batch_index, elapsed_ms, "Batch timed out");
            }
            SlotOutcome::Crashed => {
                tracing::error!(slot = report.slot, batch = report.batch_index, elapsed_ms, "Batch worker crashed");
            }
        }

        self.progress.inc(report.results.len() as u64);
        state.results.extend(report.results);
        state.idle.push_back(report.slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{partition, Job};
    use crate::config::ReportingMode;
    use crate::batch::JobId;
    use crate::summary::ErrorKind;
    use crate::worker::processor_fn;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn jobs(n: usize) -> Vec<Job> {
        (1..=n).map(|i| Job::new(format!("job-{}", i))).collect()
    }

    fn supervisor(ms: u64) -> TimeoutSupervisor {
        TimeoutSupervisor::new(Duration::from_millis(ms), ReportingMode::Aggregated)
    }

    fn idle_pool() -> WorkerPool {
        let processor = processor_fn(|job: Job| async move { Ok::<_, anyhow::Error>(job.id.to_string()) });
        WorkerPool::new(2, supervisor(1_000), processor)
    }

    /// State with one slot marked active for `batch_index`, backed by a task that never reports
    fn state_with_active_slot(slot: SlotId, batch_index: usize, jobs: usize) -> PoolState {
        let mut state = PoolState::new(Vec::new(), 2);
        state.active.insert(
            slot,
            ActiveSlot {
                batch_index,
                jobs,
                dispatched_at: Instant::now(),
                _task: AbortOnDrop::new(tokio::spawn(std::future::pending::<()>())),
            },
        );
        state
    }

    fn report(slot: SlotId, batch_index: usize, ids: &[&str]) -> SlotReport {
        SlotReport {
            slot,
            batch_index,
            outcome: SlotOutcome::Completed,
            results: ids
                .iter()
                .map(|id| ExecutionResult::success(JobId::from(*id), String::new(), Duration::ZERO))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_empty_run_returns_immediately() {
        let processor = processor_fn(|job: Job| async move {
            Err::<String, _>(anyhow::anyhow!("{} should never run", job.id))
        });
        let pool = WorkerPool::new(4, supervisor(100), processor);

        let results = pool.run(Vec::new()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_one_result_per_job_for_various_shapes() {
        for (n, batch_size, pool_size) in [(1, 1, 1), (7, 3, 2), (10, 1, 4), (9, 9, 3), (5, 2, 8)] {
            let processor = processor_fn(|job: Job| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, anyhow::Error>(job.id.to_string())
            });
            let pool = WorkerPool::new(pool_size, supervisor(1_000), processor);

            let input = jobs(n);
            let results = pool.run(partition(&input, batch_size).unwrap()).await.unwrap();

            assert_eq!(results.len(), n);
            let distinct: HashSet<String> = results.iter().map(|r| r.job_id.to_string()).collect();
            assert_eq!(distinct.len(), n);
            assert!(results.iter().all(|r| r.succeeded));
        }
    }

    #[tokio::test]
    async fn test_never_exceeds_pool_size() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (running_c, peak_c) = (running.clone(), peak.clone());
        let processor = processor_fn(move |_job: Job| {
            let running = running_c.clone();
            let peak = peak_c.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(String::new())
            }
        });

        let pool = WorkerPool::new(3, supervisor(5_000), processor);
        let results = pool.run(partition(&jobs(12), 1).unwrap()).await.unwrap();

        assert_eq!(results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_timed_out_slot_is_reused() {
        let processor = processor_fn(|job: Job| async move {
            if job.id.as_str() == "job-1" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok::<_, anyhow::Error>(job.id.to_string())
        });

        // A single slot: the remaining batches can only run if the hung slot is freed.
        let pool = WorkerPool::new(1, supervisor(150), processor);
        let results = pool.run(partition(&jobs(4), 1).unwrap()).await.unwrap();

        assert_eq!(results.len(), 4);
        let hung = results.iter().find(|r| r.job_id.as_str() == "job-1").unwrap();
        assert_eq!(hung.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(results.iter().filter(|r| r.succeeded).count(), 3);
    }

    #[tokio::test]
    async fn test_lost_supervisor_fails_with_worker_lost() {
        let pool = idle_pool();
        let mut state = state_with_active_slot(0, 0, 1);
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel::<SlotReport>();
        drop(reports_tx);

        let err = pool.drive(&mut state, &mut reports_rx, None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::WorkerLost { active: 1 })
        ));
    }

    #[tokio::test]
    async fn test_short_report_fails_the_run() {
        let pool = idle_pool();
        let mut state = state_with_active_slot(0, 3, 2);
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        reports_tx.send(report(0, 3, &["only-one"])).unwrap();

        let err = pool
            .drive(&mut state, &mut reports_rx, Some(reports_tx))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::InvariantViolation { .. })
        ));
        assert!(state.results.is_empty());
    }

    #[tokio::test]
    async fn test_report_for_wrong_batch_is_rejected() {
        let pool = idle_pool();
        let mut state = state_with_active_slot(1, 5, 1);

        let err = pool.complete(&mut state, report(1, 6, &["x"])).unwrap_err();
        assert!(err.to_string().contains("batch 6"));
        assert!(state.results.is_empty());
    }

    #[tokio::test]
    async fn test_report_from_inactive_slot_is_rejected() {
        let pool = idle_pool();
        let mut state = state_with_active_slot(0, 0, 1);

        let err = pool.complete(&mut state, report(3, 0, &["x"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::InvariantViolation { .. })
        ));
        assert!(state.active.contains_key(&0));
        assert!(state.idle.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_run_aborts_active_slots() {
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_c = finished.clone();
        let processor = processor_fn(move |_job: Job| {
            let finished = finished_c.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(String::new())
            }
        });
        let pool = WorkerPool::new(2, supervisor(10_000), processor);

        let run = pool.run(partition(&jobs(2), 1).unwrap());
        assert!(tokio::time::timeout(Duration::from_millis(50), run).await.is_err());
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
