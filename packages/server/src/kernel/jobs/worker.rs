//! Worker service that drains the tagging queue.
//!
//! The worker claims jobs from the queue, hands each to the processor,
//! and maps the outcome back into queue semantics: success completes the
//! job, a transient failure re-enters the queue for backoff retry, a
//! permanent failure discards it. Up to `concurrency` jobs run in
//! parallel; within one job all pipeline stages are sequential.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::TagJobPayload;
use super::queue::JobQueue;
use crate::kernel::error::TaggingError;

/// Handler trait for executing claimed jobs.
///
/// The production implementation is the tagging pipeline; tests swap in
/// canned outcomes.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, payload: &TagJobPayload) -> Result<(), TaggingError>;
}

/// Configuration for the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs processed in parallel.
    pub concurrency: usize,
    /// How long to wait when no jobs are available.
    pub poll_interval: Duration,
    /// Grace window for in-flight jobs on shutdown.
    pub drain_timeout: Duration,
    /// Worker ID for this instance.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Default::default()
        }
    }
}

/// Long-running queue consumer.
pub struct TagWorker {
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
}

impl TagWorker {
    pub fn new(queue: Arc<dyn JobQueue>, processor: Arc<dyn JobProcessor>) -> Self {
        Self {
            queue,
            processor,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(
        queue: Arc<dyn JobQueue>,
        processor: Arc<dyn JobProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            config,
        }
    }

    /// Run until shutdown. In-flight jobs get `drain_timeout` to finish;
    /// anything still running past that stays claimed in the queue and is
    /// redelivered on restart (at-least-once semantics).
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "tag worker starting"
        );

        let slots = Arc::new(Semaphore::new(self.config.concurrency));

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Hold a slot before claiming so the queue never hands us
            // more than `concurrency` jobs.
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.claim().await {
                Ok(Some(job)) => {
                    let queue = Arc::clone(&self.queue);
                    let processor = Arc::clone(&self.processor);
                    tokio::spawn(async move {
                        let _slot = permit;
                        process_one(queue, processor, job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    drop(permit);
                    error!(error = %err, "failed to claim jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        // Drain: wait for every slot to come back.
        let drained = tokio::time::timeout(
            self.config.drain_timeout,
            slots.acquire_many(self.config.concurrency as u32),
        )
        .await;
        match drained {
            Ok(Ok(_)) => info!(worker_id = %self.config.worker_id, "tag worker stopped"),
            _ => warn!(
                worker_id = %self.config.worker_id,
                "drain timeout, in-flight jobs will be redelivered"
            ),
        }

        Ok(())
    }
}

async fn process_one(
    queue: Arc<dyn JobQueue>,
    processor: Arc<dyn JobProcessor>,
    job: super::job::QueuedJob,
) {
    let job_id = job.id.clone();
    let repository_id = job.payload.repository_id.clone();

    match processor.process(&job.payload).await {
        Ok(()) => {
            debug!(job_id = %job_id, repository_id = %repository_id, "job succeeded");
            if let Err(err) = queue.complete(&job).await {
                error!(job_id = %job_id, error = %err, "failed to mark job as completed");
            }
        }
        Err(err) => {
            let transient = err.is_transient();
            warn!(
                job_id = %job_id,
                repository_id = %repository_id,
                attempt = job.attempt,
                transient,
                error = %err,
                "job failed"
            );
            if let Err(mark_err) = queue.fail(&job, &err.message(), transient).await {
                error!(job_id = %job_id, error = %mark_err, "failed to mark job as failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::queue::testing::RecordingJobQueue;
    use crate::kernel::jobs::JobTrigger;

    struct OutcomeProcessor;

    #[async_trait]
    impl JobProcessor for OutcomeProcessor {
        async fn process(&self, payload: &TagJobPayload) -> Result<(), TaggingError> {
            match payload.repository_id.as_str() {
                "ok" => Ok(()),
                "broken" => Err(TaggingError::permanent(anyhow::anyhow!(
                    "metadata missing repoUrl"
                ))),
                _ => Err(TaggingError::transient(anyhow::anyhow!("http 503"))),
            }
        }
    }

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 2);
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn concurrency_is_at_least_one() {
        assert_eq!(WorkerConfig::with_concurrency(0).concurrency, 1);
    }

    #[tokio::test]
    async fn worker_completes_and_discards() {
        let queue = Arc::new(RecordingJobQueue::new());
        queue
            .enqueue(TagJobPayload::new("ok", JobTrigger::Event))
            .await
            .unwrap();
        queue
            .enqueue(TagJobPayload::new("broken", JobTrigger::Event))
            .await
            .unwrap();

        let worker = TagWorker::with_config(
            queue.clone(),
            Arc::new(OutcomeProcessor),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                drain_timeout: Duration::from_secs(1),
                ..WorkerConfig::default()
            },
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(queue.completed_ids().len(), 1);
        let failures = queue.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("repoUrl"));
        assert!(!failures[0].2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_by_the_queue() {
        let queue = Arc::new(RecordingJobQueue::new());
        queue
            .enqueue(TagJobPayload::new("flaky", JobTrigger::Event))
            .await
            .unwrap();

        let worker = TagWorker::with_config(
            queue.clone(),
            Arc::new(OutcomeProcessor),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                drain_timeout: Duration::from_secs(1),
                ..WorkerConfig::default()
            },
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        // All three attempts failed transiently, then the job was discarded.
        let failures = queue.failures();
        assert_eq!(failures.len(), 3);
        assert!(failures[0].2);
        assert!(failures[1].2);
        assert!(!failures[2].2);
        assert!(queue.claim().await.unwrap().is_none());
    }
}
