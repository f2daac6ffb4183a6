//! Event admission: from the pub/sub channel into the job queue.
//!
//! Subscribes to the events channel, normalizes both inbound envelope
//! shapes, and enqueues tagging jobs for repositories that became ready
//! and were not recently tagged. Malformed messages and handler errors
//! are logged and dropped; the subscription itself stays connected.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audit::AuditStore;
use super::events::{InboundEnvelope, NormalizedRepositoryEvent};
use super::jobs::{EnqueueResult, JobQueue, JobTrigger, TagJobPayload};

/// A successful run within this window suppresses event-driven enqueues.
pub const EVENT_RECENCY_WINDOW: Duration = Duration::from_secs(12 * 60 * 60);

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Callback for repository events that do not enqueue work.
pub type RepositoryEventListener = Arc<dyn Fn(&NormalizedRepositoryEvent) + Send + Sync>;

pub struct EventAdmission {
    queue: Arc<dyn JobQueue>,
    store: Arc<AuditStore>,
    listener: Option<RepositoryEventListener>,
}

impl EventAdmission {
    pub fn new(queue: Arc<dyn JobQueue>, store: Arc<AuditStore>) -> Self {
        Self {
            queue,
            store,
            listener: None,
        }
    }

    /// Forward non-enqueueing repository events to `listener`.
    pub fn with_listener(mut self, listener: RepositoryEventListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Handle one raw channel message. Returns the enqueue result when a
    /// job was admitted.
    pub async fn handle_message(&self, raw: &str) -> Result<Option<EnqueueResult>> {
        let envelope = match InboundEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping malformed event message");
                return Ok(None);
            }
        };

        let event = envelope.normalize();
        if !event.name.starts_with("repository.") {
            return Ok(None);
        }

        if !matches!(
            event.name.as_str(),
            "repository.updated" | "repository.ingestion-event"
        ) {
            if let Some(listener) = &self.listener {
                listener(&event);
            }
            return Ok(None);
        }

        let Some(repository_id) = event.repository_id.as_deref() else {
            debug!(event = %event.name, "repository event without repository id, dropped");
            return Ok(None);
        };

        if event.ingest_status.as_deref() != Some("ready") {
            debug!(
                event = %event.name,
                repository_id = %repository_id,
                ingest_status = ?event.ingest_status,
                "repository not ready, dropped"
            );
            return Ok(None);
        }

        if self
            .store
            .has_recent_successful_run(repository_id, EVENT_RECENCY_WINDOW)
            .await?
        {
            debug!(
                repository_id = %repository_id,
                "recently tagged, enqueue suppressed"
            );
            return Ok(None);
        }

        let payload =
            TagJobPayload::new(repository_id, JobTrigger::Event).with_reason(event.name.clone());
        let result = self.queue.enqueue(payload).await?;

        debug!(
            repository_id = %repository_id,
            job_id = %result.job_id(),
            created = result.is_created(),
            "event admitted"
        );
        Ok(Some(result))
    }

    /// Subscribe and process messages until shutdown, reconnecting on any
    /// subscription failure. Unsubscribes before closing.
    pub async fn run(
        self: Arc<Self>,
        client: redis::Client,
        channel: String,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    if let Err(err) = pubsub.subscribe(&channel).await {
                        warn!(channel = %channel, error = %err, "subscribe failed");
                    } else {
                        info!(channel = %channel, "subscribed to events channel");
                        self.pump(&mut pubsub, &shutdown).await;

                        if shutdown.is_cancelled() {
                            if let Err(err) = pubsub.unsubscribe(&channel).await {
                                debug!(error = %err, "unsubscribe failed during shutdown");
                            }
                            break;
                        }
                        warn!(channel = %channel, "events subscription ended, reconnecting");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "pub/sub connection failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        info!("event admission stopped");
        Ok(())
    }

    /// Drain messages from one subscription until it ends or shutdown.
    async fn pump(&self, pubsub: &mut redis::aio::PubSub, shutdown: &CancellationToken) {
        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = stream.next() => {
                    let Some(message) = message else { break };
                    let raw: String = match message.get_payload() {
                        Ok(raw) => raw,
                        Err(err) => {
                            warn!(error = %err, "dropping non-text event message");
                            continue;
                        }
                    };
                    if let Err(err) = self.handle_message(&raw).await {
                        warn!(error = %err, "event handling failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::audit::{RunDetails, RunStatus};
    use crate::kernel::jobs::testing::RecordingJobQueue;
    use crate::kernel::jobs::job_id_for_repository;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn admission() -> (Arc<RecordingJobQueue>, Arc<AuditStore>, EventAdmission) {
        let queue = Arc::new(RecordingJobQueue::new());
        let store = Arc::new(AuditStore::in_memory().await.unwrap());
        let admission = EventAdmission::new(queue.clone(), store.clone());
        (queue, store, admission)
    }

    #[tokio::test]
    async fn ready_repository_is_admitted() {
        let (queue, _store, admission) = admission().await;

        let result = admission
            .handle_message(
                r#"{"event":"repository.updated","payload":{"repository":{"id":"r1","ingestStatus":"ready"}}}"#,
            )
            .await
            .unwrap()
            .unwrap();

        assert!(result.is_created());
        assert_eq!(result.job_id(), job_id_for_repository("r1"));

        let enqueued = queue.enqueued();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].repository_id, "r1");
        assert_eq!(enqueued[0].trigger, JobTrigger::Event);
    }

    #[tokio::test]
    async fn pending_repository_is_not_admitted() {
        let (queue, _store, admission) = admission().await;

        let result = admission
            .handle_message(
                r#"{"event":"repository.updated","payload":{"repository":{"id":"r1","ingestStatus":"pending"}}}"#,
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(queue.enqueued_count(), 0);
    }

    #[tokio::test]
    async fn envelope_shape_is_admitted() {
        let (queue, _store, admission) = admission().await;

        let result = admission
            .handle_message(
                r#"{"event":{"type":"repository.ingestion-event","data":{"repository":{"id":"r2","ingestStatus":"ready"}}}}"#,
            )
            .await
            .unwrap()
            .unwrap();

        assert!(result.is_created());
        assert_eq!(queue.enqueued()[0].repository_id, "r2");
    }

    #[tokio::test]
    async fn recent_success_suppresses_enqueue() {
        let (queue, store, admission) = admission().await;

        let job = store.upsert_job("r3").await.unwrap();
        let run = store.start_run(job.id).await.unwrap();
        store
            .complete_run(run.id, RunStatus::Succeeded, RunDetails::default())
            .await
            .unwrap();

        let result = admission
            .handle_message(
                r#"{"event":"repository.updated","payload":{"repository":{"id":"r3","ingestStatus":"ready"}}}"#,
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(queue.enqueued_count(), 0);
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let (queue, _store, admission) = admission().await;

        assert!(admission.handle_message("not json").await.unwrap().is_none());
        assert!(admission
            .handle_message(r#"{"event":42}"#)
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.enqueued_count(), 0);
    }

    #[tokio::test]
    async fn missing_repository_id_is_dropped() {
        let (queue, _store, admission) = admission().await;

        let result = admission
            .handle_message(r#"{"event":"repository.updated","payload":{}}"#)
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(queue.enqueued_count(), 0);
    }

    #[tokio::test]
    async fn non_repository_events_are_ignored() {
        let (queue, _store, admission) = admission().await;

        let result = admission
            .handle_message(r#"{"event":"build.completed","payload":{}}"#)
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(queue.enqueued_count(), 0);
    }

    #[tokio::test]
    async fn other_repository_events_reach_the_listener_without_enqueue() {
        let queue = Arc::new(RecordingJobQueue::new());
        let store = Arc::new(AuditStore::in_memory().await.unwrap());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_listener = seen.clone();

        let admission = EventAdmission::new(queue.clone(), store).with_listener(Arc::new(
            move |event: &NormalizedRepositoryEvent| {
                assert_eq!(event.name, "repository.deleted");
                seen_in_listener.fetch_add(1, Ordering::SeqCst);
            },
        ));

        let result = admission
            .handle_message(
                r#"{"event":"repository.deleted","payload":{"repository":{"id":"r9"}}}"#,
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(queue.enqueued_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_admissions_collapse() {
        let (queue, _store, admission) = admission().await;
        let raw =
            r#"{"event":"repository.updated","payload":{"repository":{"id":"r1","ingestStatus":"ready"}}}"#;

        let first = admission.handle_message(raw).await.unwrap().unwrap();
        let second = admission.handle_message(raw).await.unwrap().unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(queue.enqueued_count(), 1);
    }
}
