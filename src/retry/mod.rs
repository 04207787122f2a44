use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::batch::{Job, JobId};
use crate::config::RetryConfig;
use crate::summary::ExecutionResult;
use crate::worker::{self, JobProcessor};
use crate::OrchestratorError;

/// Exponential delay between attempts of the same job during the retry pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the second attempt
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor per attempt
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// No waiting at all between attempts
    pub fn none() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay to wait after the `failures`-th failed attempt (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    pub fn validate(&self) -> std::result::Result<(), OrchestratorError> {
        if !(self.multiplier >= 1.0) {
            return Err(OrchestratorError::InvalidConfig(
                "backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(OrchestratorError::InvalidConfig(
                "backoff initial_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Match pool results back to the submitted jobs, in submission order.
///
/// Every job must have exactly one result; a missing, duplicated or unknown result
/// is an internal defect and fails the run.
pub fn collate(jobs: &[Job], results: Vec<ExecutionResult>) -> std::result::Result<Vec<ExecutionResult>, OrchestratorError> {
    let mut by_id: HashMap<JobId, ExecutionResult> = HashMap::with_capacity(results.len());

    for result in results {
        let job_id = result.job_id.clone();
        if by_id.insert(job_id.clone(), result).is_some() {
            return Err(OrchestratorError::InvariantViolation {
                job_id: job_id.to_string(),
                detail: "more than one terminal result".to_string(),
            });
        }
    }

    let mut ordered = Vec::with_capacity(jobs.len());
    for job in jobs {
        let result = by_id.remove(&job.id).ok_or_else(|| OrchestratorError::InvariantViolation {
            job_id: job.id.to_string(),
            detail: "no terminal result was produced".to_string(),
        })?;
        ordered.push(result);
    }

    if let Some(stray) = by_id.into_keys().next() {
        return Err(OrchestratorError::InvariantViolation {
            job_id: stray.to_string(),
            detail: "result for a job that was never submitted".to_string(),
        });
    }

    Ok(ordered)
}

/// Sequential, single-threaded recovery pass over failed jobs.
///
/// Without an attempt deadline a hung job stalls the whole pass; set
/// `retry.attempt_deadline_ms` to bound it.
pub struct RetryPass {
    processor: Arc<dyn JobProcessor>,
    attempts: u32,
    attempt_deadline: Option<Duration>,
    backoff: BackoffPolicy,
}

impl RetryPass {
    pub fn new(processor: Arc<dyn JobProcessor>, config: &RetryConfig) -> Self {
        Self {
            processor,
            attempts: config.attempts.max(1),
            attempt_deadline: config.attempt_deadline(),
            backoff: config.backoff.clone(),
        }
    }

    /// Re-run every failed entry of `results` (aligned with `jobs`) and replace it with
    /// its new terminal outcome. Returns how many jobs were recovered.
    pub async fn run(&self, jobs: &[Job], results: &mut [ExecutionResult]) -> usize {
        let failed = results.iter().filter(|r| !r.succeeded).count();
        if failed == 0 {
            return 0;
        }

        tracing::info!(failed, attempts = self.attempts, "Starting retry pass");

        let mut recovered = 0;
        for (job, slot) in jobs.iter().zip(results.iter_mut()) {
            if slot.succeeded {
                continue;
            }

            tracing::info!(
                job_id = %job.id,
                previous_error = slot.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                "Retrying job"
            );

            let outcome = self.retry_job(job, slot.attempts).await;
            if outcome.succeeded {
                recovered += 1;
            }
            *slot = outcome;
        }

        tracing::info!(recovered, still_failed = failed - recovered, "Retry pass finished");
        recovered
    }

    async fn retry_job(&self, job: &Job, prior_attempts: u32) -> ExecutionResult {
        let mut made = 0;
        loop {
            if made > 0 {
                let delay = self.backoff.delay_for(made);
                if !delay.is_zero() {
                    tracing::debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "Backing off");
                    tokio::time::sleep(delay).await;
                }
            }

            let mut result = self.attempt(job).await;
            made += 1;

            if result.succeeded || made >= self.attempts {
                result.retried = true;
                result.attempts = prior_attempts + made;
                if !result.succeeded {
                    tracing::warn!(
                        job_id = %job.id,
                        error = result.error_message.as_deref().unwrap_or_default(),
                        "Job still failing after retry"
                    );
                }
                return result;
            }
        }
    }

    async fn attempt(&self, job: &Job) -> ExecutionResult {
        let run = worker::execute_job(self.processor.as_ref(), job);
        match self.attempt_deadline {
            None => run.await,
            Some(deadline) => match tokio::time::timeout(deadline, run).await {
                Ok(result) => result,
                Err(_) => ExecutionResult::timeout(job.id.clone(), deadline),
            },
        }
    }
}
