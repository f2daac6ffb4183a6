//! Lifecycle notifications to the events channel and optional webhook.
//!
//! Notification failures are advisory: they are logged and suppressed,
//! and never affect the recorded outcome of a run. Webhook delivery
//! retries once; the pub/sub publish does not.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bus::BusPublisher;
use super::jobs::{JobTrigger, QueueTransition};

/// Wire envelope for every outbound event.
#[derive(Debug, Serialize)]
struct EventEnvelope<'a, T: Serialize> {
    event: &'a str,
    payload: &'a T,
    #[serde(rename = "emittedAt")]
    emitted_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggingCompleted {
    pub repository_id: String,
    pub job_run_id: i64,
    pub repository_tag_count: usize,
    pub file_tag_count: usize,
    pub trigger: JobTrigger,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggingFailed {
    pub repository_id: String,
    pub job_run_id: i64,
    pub error: String,
    pub transient: bool,
    pub trigger: JobTrigger,
}

pub struct Notifier {
    bus: Arc<dyn BusPublisher>,
    channel: String,
    webhook: Option<WebhookClient>,
}

impl Notifier {
    pub fn new(
        bus: Arc<dyn BusPublisher>,
        channel: impl Into<String>,
        webhook_url: Option<String>,
    ) -> Result<Self> {
        let webhook = webhook_url.map(WebhookClient::new).transpose()?;
        Ok(Self {
            bus,
            channel: channel.into(),
            webhook,
        })
    }

    pub async fn tagging_completed(&self, payload: TaggingCompleted) {
        self.emit("tagging.completed", &payload).await;
    }

    pub async fn tagging_failed(&self, payload: TaggingFailed) {
        self.emit("tagging.failed", &payload).await;
    }

    /// Mirror queue transitions onto the events channel until shutdown.
    pub async fn relay_queue_transitions(
        &self,
        mut transitions: broadcast::Receiver<QueueTransition>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = transitions.recv() => match received {
                    Ok(transition) => {
                        let name = format!("tagging.queue.{}", transition.name());
                        self.emit(&name, &transition).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "queue transition relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn emit<T: Serialize>(&self, event: &str, payload: &T) {
        let envelope = EventEnvelope {
            event,
            payload,
            emitted_at: Utc::now().to_rfc3339(),
        };
        let body = match serde_json::to_string(&envelope) {
            Ok(body) => body,
            Err(err) => {
                warn!(event = %event, error = %err, "failed to serialize notification");
                return;
            }
        };

        if let Err(err) = self.bus.publish(&self.channel, body.clone()).await {
            warn!(event = %event, error = %err, "event publish failed, suppressed");
        } else {
            debug!(event = %event, channel = %self.channel, "published event");
        }

        if let Some(webhook) = &self.webhook {
            webhook.deliver(&body).await;
        }
    }
}

/// Outbound lifecycle webhook with a single retry.
struct WebhookClient {
    client: reqwest::Client,
    url: String,
}

impl WebhookClient {
    fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create webhook HTTP client")?;
        Ok(Self { client, url })
    }

    async fn deliver(&self, body: &str) {
        for attempt in 1..=2u32 {
            match self.post(body).await {
                Ok(()) => return,
                Err(err) if attempt == 1 => {
                    warn!(error = %err, "webhook delivery failed, retrying once");
                }
                Err(err) => {
                    warn!(error = %err, "webhook delivery failed, suppressed");
                }
            }
        }
    }

    async fn post(&self, body: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .context("Failed to send webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("Webhook error: {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::bus::TestBus;

    #[tokio::test]
    async fn completed_events_use_the_wire_envelope() {
        let bus = Arc::new(TestBus::new());
        let notifier = Notifier::new(bus.clone(), "apphub:events", None).unwrap();

        notifier
            .tagging_completed(TaggingCompleted {
                repository_id: "r1".to_string(),
                job_run_id: 7,
                repository_tag_count: 3,
                file_tag_count: 2,
                trigger: JobTrigger::Event,
            })
            .await;

        let messages = bus.messages_for_channel("apphub:events");
        assert_eq!(messages.len(), 1);

        let value: serde_json::Value = bus.deserialize_message(&messages[0]).unwrap();
        assert_eq!(value["event"], "tagging.completed");
        assert_eq!(value["payload"]["repositoryId"], "r1");
        assert_eq!(value["payload"]["jobRunId"], 7);
        assert_eq!(value["payload"]["trigger"], "event");
        assert!(value["emittedAt"].is_string());
    }

    #[tokio::test]
    async fn failed_events_carry_the_transient_flag() {
        let bus = Arc::new(TestBus::new());
        let notifier = Notifier::new(bus.clone(), "apphub:events", None).unwrap();

        notifier
            .tagging_failed(TaggingFailed {
                repository_id: "r4".to_string(),
                job_run_id: 9,
                error: "repository metadata missing repoUrl".to_string(),
                transient: false,
                trigger: JobTrigger::Event,
            })
            .await;

        let messages = bus.messages_for_channel("apphub:events");
        let value: serde_json::Value = bus.deserialize_message(&messages[0]).unwrap();
        assert_eq!(value["event"], "tagging.failed");
        assert_eq!(value["payload"]["transient"], false);
        assert!(value["payload"]["error"]
            .as_str()
            .unwrap()
            .contains("repoUrl"));
    }

    #[tokio::test]
    async fn queue_transitions_are_mirrored() {
        let bus = Arc::new(TestBus::new());
        let notifier = Arc::new(Notifier::new(bus.clone(), "apphub:events", None).unwrap());

        let (tx, rx) = broadcast::channel(8);
        let shutdown = CancellationToken::new();
        let relay = {
            let notifier = notifier.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { notifier.relay_queue_transitions(rx, shutdown).await })
        };

        tx.send(QueueTransition::Waiting {
            job_id: "tag-1".to_string(),
            repository_id: "r1".to_string(),
            trigger: JobTrigger::Scheduler,
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        relay.await.unwrap();

        let messages = bus.messages_for_channel("apphub:events");
        assert_eq!(messages.len(), 1);
        let value: serde_json::Value = bus.deserialize_message(&messages[0]).unwrap();
        assert_eq!(value["event"], "tagging.queue.waiting");
    }
}
