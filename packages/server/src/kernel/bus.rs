//! Pub/sub publisher abstraction for production and testing.
//!
//! Provides a trait-based publisher that allows swapping between a real
//! Redis connection and a test capture.

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::RwLock;

/// A published message.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub channel: String,
    pub payload: String,
}

/// Trait for pub/sub publish operations.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish a message to a channel.
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;
}

/// Real Redis publisher backed by the shared connection pool.
pub struct RedisBusPublisher {
    pool: deadpool_redis::Pool,
}

impl RedisBusPublisher {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BusPublisher for RedisBusPublisher {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}

/// Mock bus that records published messages for test assertions.
#[derive(Default)]
pub struct TestBus {
    published: RwLock<Vec<PublishedMessage>>,
}

impl TestBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all published messages.
    pub fn published_messages(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Get published messages for a specific channel.
    pub fn messages_for_channel(&self, channel: &str) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    /// Get the count of published messages.
    pub fn publish_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deserialize a published message payload as JSON.
    pub fn deserialize_message<T: serde::de::DeserializeOwned>(
        &self,
        msg: &PublishedMessage,
    ) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_str(&msg.payload)
    }
}

#[async_trait]
impl BusPublisher for TestBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                channel: channel.to_string(),
                payload,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_records_messages() {
        let bus = TestBus::new();

        bus.publish("apphub:events", r#"{"event":"tagging.completed"}"#.to_string())
            .await
            .unwrap();
        bus.publish("other", "{}".to_string()).await.unwrap();

        assert_eq!(bus.publish_count(), 2);
        assert_eq!(bus.messages_for_channel("apphub:events").len(), 1);
        assert_eq!(bus.messages_for_channel("missing").len(), 0);
    }
}
