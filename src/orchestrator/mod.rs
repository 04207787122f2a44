use chrono::Utc;
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::batch::{partition, Job};
use crate::config::{Config, OrchestratorConfig, RetryConfig};
use crate::pool::WorkerPool;
use crate::retry::{collate, RetryPass};
use crate::summary::{ExecutionResult, RunSummary};
use crate::supervisor::TimeoutSupervisor;
use crate::worker::JobProcessor;
use crate::{OrchestratorError, Result};

/// Everything a run produced: the summary plus one terminal result per job,
/// in submission order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub summary: RunSummary,
    pub results: Vec<ExecutionResult>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| !r.succeeded)
    }
}

/// Drives one run: batching, the parallel phase, collation and the retry pass
pub struct Orchestrator {
    processor: Arc<dyn JobProcessor>,
    settings: OrchestratorConfig,
    retry: RetryConfig,
    progress: ProgressBar,
}

impl Orchestrator {
    pub fn new(processor: Arc<dyn JobProcessor>, config: &Config) -> Self {
        Self {
            processor,
            settings: config.orchestrator.clone(),
            retry: config.retry.clone(),
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub async fn run(&self, jobs: &[Job]) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id);
        self.run_inner(run_id, jobs).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, jobs: &[Job]) -> Result<RunReport> {
        self.settings.validate()?;
        self.retry.validate()?;
        ensure_unique(jobs)?;

        let started_at = Utc::now();

        if jobs.is_empty() {
            tracing::info!("No jobs submitted, nothing to do");
            return Ok(RunReport {
                run_id,
                summary: RunSummary::compute(&[], &[], started_at),
                results: Vec::new(),
            });
        }

        let batches = partition(jobs, self.settings.batch_size)?;
        let pool_size = self.settings.effective_pool_size();
        tracing::info!(
            jobs = jobs.len(),
            batches = batches.len(),
            pool_size,
            batch_size = self.settings.batch_size,
            retry = self.settings.retry_failed,
            "Starting run"
        );

        self.progress.set_length(jobs.len() as u64);
        self.progress.set_message("Processing jobs...");

        let supervisor = TimeoutSupervisor::new(self.settings.deadline(), self.settings.reporting);
        let pool = WorkerPool::new(pool_size, supervisor, self.processor.clone())
            .with_progress(self.progress.clone());

        let raw = pool.run(batches).await?;
        let parallel = collate(jobs, raw)?;

        let mut terminal = parallel.clone();
        if self.settings.retry_failed {
            self.progress.set_message("Retrying failed jobs...");
            RetryPass::new(self.processor.clone(), &self.retry)
                .run(jobs, &mut terminal)
                .await;
        }

        let summary = RunSummary::compute(&parallel, &terminal, started_at);
        self.progress.finish_with_message("Run complete");

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            recovered = summary.recovered_by_retry,
            elapsed_ms = summary.elapsed_ms,
            "Run finished"
        );

        Ok(RunReport {
            run_id,
            summary,
            results: terminal,
        })
    }
}

fn ensure_unique(jobs: &[Job]) -> std::result::Result<(), OrchestratorError> {
    let mut seen = HashSet::with_capacity(jobs.len());
    for job in jobs {
        if !seen.insert(&job.id) {
            return Err(OrchestratorError::DuplicateJob(job.id.to_string()));
        }
    }
    Ok(())
}

/// Run `jobs` through `processor` with `config` and report the outcome
pub async fn run_batch_jobs(
    jobs: &[Job],
    processor: Arc<dyn JobProcessor>,
    config: &Config,
) -> Result<RunReport> {
    Orchestrator::new(processor, config).run(jobs).await
}
