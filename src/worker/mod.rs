use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

use crate::batch::{Batch, Job};
use crate::summary::ExecutionResult;

/// Identifier of a worker slot inside the pool
pub type SlotId = usize;

/// The external processing capability: everything domain specific (downloads,
/// transcription, caption upload) happens behind this trait.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process one job, returning its opaque output
    async fn process(&self, job: &Job) -> anyhow::Result<String>;
}

/// Adapter turning an async closure into a [`JobProcessor`]
pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> anyhow::Result<String> {
        (self.f)(job.clone()).await
    }
}

/// Wrap an async closure as a shareable processor
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn JobProcessor>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    Arc::new(FnProcessor { f })
}

/// Invoke the processor for one job and time it.
///
/// Errors and panics both become `processing_error` records; nothing escapes.
pub async fn execute_job(processor: &dyn JobProcessor, job: &Job) -> ExecutionResult {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(processor.process(job)).catch_unwind().await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(output)) => ExecutionResult::success(job.id.clone(), output, elapsed),
        Ok(Err(e)) => ExecutionResult::processing_error(job.id.clone(), format!("{:#}", e), elapsed),
        Err(panic) => ExecutionResult::processing_error(
            job.id.clone(),
            format!("processor panicked: {}", panic_message(panic.as_ref())),
            elapsed,
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Worker execution context: run every job of `batch` strictly in order.
///
/// The returned vector is the single aggregated report for the batch. When `stream`
/// is set, each result is additionally sent as soon as its job finishes so the
/// supervisor can keep finished work if the batch is later terminated.
pub async fn run_batch(
    slot: SlotId,
    batch: Batch,
    processor: Arc<dyn JobProcessor>,
    stream: Option<UnboundedSender<ExecutionResult>>,
) -> Vec<ExecutionResult> {
    let mut results = Vec::with_capacity(batch.len());

    for job in batch.jobs() {
        tracing::debug!(slot, batch = batch.index, job_id = %job.id, "Processing job");

        let result = execute_job(processor.as_ref(), job).await;

        if result.succeeded {
            tracing::debug!(
                slot,
                job_id = %job.id,
                elapsed_ms = result.processing_time_ms,
                "Job succeeded"
            );
        } else {
            tracing::warn!(
                slot,
                job_id = %job.id,
                error = result.error_message.as_deref().unwrap_or_default(),
                "Job failed, continuing with the rest of the batch"
            );
        }

        if let Some(stream) = &stream {
            // The supervisor only drops its receiver after giving up on this worker.
            let _ = stream.send(result.clone());
        }

        results.push(result);
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::ErrorKind;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn batch(ids: &[&str]) -> Batch {
        Batch::new(0, ids.iter().map(|id| Job::new(*id)).collect())
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_siblings() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let processor = processor_fn(move |job: Job| {
            let seen = seen_clone.clone();
            async move {
                seen.lock().unwrap().push(job.id.to_string());
                if job.id.as_str() == "b" {
                    anyhow::bail!("transcription failed for {}", job.id);
                }
                Ok::<_, anyhow::Error>(format!("{}-ok", job.id))
            }
        });

        let results = run_batch(0, batch(&["a", "b", "c"]), processor, None).await;

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(results.len(), 3);
        assert!(results[0].succeeded);
        assert!(!results[1].succeeded);
        assert_eq!(results[1].error_kind, Some(ErrorKind::ProcessingError));
        assert!(results[1]
            .error_message
            .as_deref()
            .unwrap()
            .contains("transcription failed"));
        assert_eq!(results[2].output.as_deref(), Some("c-ok"));
    }

    #[tokio::test]
    async fn test_panic_is_isolated_per_job() {
        let processor = processor_fn(|job: Job| async move {
            if job.id.as_str() == "bad" {
                panic!("decoder exploded");
            }
            Ok::<_, anyhow::Error>("fine".to_string())
        });

        let results = run_batch(3, batch(&["bad", "good"]), processor, None).await;

        assert!(!results[0].succeeded);
        assert!(results[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("decoder exploded"));
        assert!(results[1].succeeded);
    }

    #[tokio::test]
    async fn test_streams_each_result() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor = processor_fn(|job: Job| async move { Ok::<_, anyhow::Error>(job.id.to_string()) });

        let results = run_batch(1, batch(&["x", "y"]), processor, Some(tx)).await;

        let mut streamed = Vec::new();
        while let Some(r) = rx.recv().await {
            streamed.push(r.job_id.to_string());
        }
        assert_eq!(streamed, vec!["x", "y"]);
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_execute_job_with_mock_processor() {
        let mut mock = MockJobProcessor::new();
        mock.expect_process()
            .times(1)
            .returning(|job| Ok(format!("transcript of {}", job.id)));

        let result = execute_job(&mock, &Job::new("clip.mp4")).await;
        assert!(result.succeeded);
        assert_eq!(result.output.as_deref(), Some("transcript of clip.mp4"));
        assert_eq!(result.attempts, 1);
    }
}
