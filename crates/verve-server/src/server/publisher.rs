use async_trait::async_trait;
use bytes::Bytes;
use verve_core::{Result, publisher::EventPublisher};

/// [`EventPublisher`] that writes every message to the operational log.
///
/// Used when no broker is configured; the aggregation stream still carries
/// one record per cycle, this only adds the serialized payload.
#[derive(Debug, Clone)]
pub struct LogPublisher {
    topic: String,
}

impl LogPublisher {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        tracing::info!("Publishing aggregate events to log topic `{topic}`");
        Ok(())
    }

    async fn publish(&self, key: Bytes, value: Bytes) -> Result<()> {
        tracing::info!(
            topic = %self.topic,
            key_len = key.len(),
            "Published event: {}",
            String::from_utf8_lossy(&value)
        );
        Ok(())
    }
}
