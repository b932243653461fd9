//! Event publisher capability.
//!
//! The aggregator hands one encoded [`AggregateEvent`] per window to an
//! [`EventPublisher`]. When a publish fails the leader keeps the window set,
//! so those ids are counted again in the next window's event.
//!
//! [`AggregateEvent`]: crate::types::AggregateEvent

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{collections::BTreeSet, sync::Arc};
use tokio::time::{Duration, sleep};

/// Number of attempts made by [`ensure_topic_with_retry`].
pub const TOPIC_CREATE_ATTEMPTS: usize = 10;

/// Fixed delay between topic creation attempts.
pub const TOPIC_CREATE_BACKOFF: Duration = Duration::from_millis(5);

/// A message-queue producer bound to a single topic.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    /// Creates `topic` if it does not exist yet.
    async fn ensure_topic(&self, topic: &str) -> Result<()>;

    /// Publishes one message.
    async fn publish(&self, key: Bytes, value: Bytes) -> Result<()>;

    /// Flushes and releases the producer.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Calls [`EventPublisher::ensure_topic`] up to `attempts` times, sleeping
/// `backoff` between failures. Returns the last error if every attempt fails.
pub async fn ensure_topic_with_retry<P>(
    publisher: &P,
    topic: &str,
    attempts: usize,
    backoff: Duration,
) -> Result<()>
where
    P: EventPublisher + ?Sized,
{
    let mut last_err = Error::Publish {
        context: format!("no attempt made to create topic `{topic}`"),
    };

    for attempt in 1..=attempts {
        match publisher.ensure_topic(topic).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!("fail to create topic `{topic}` (attempt {attempt}/{attempts}): {e}");
                last_err = e;
            }
        }
        if attempt < attempts {
            sleep(backoff).await;
        }
    }

    Err(last_err)
}

/// A message recorded by [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Debug, Default)]
struct State {
    topics: BTreeSet<String>,
    messages: Vec<Message>,
    failing_publishes: usize,
    failing_topic_creates: usize,
}

/// In-process [`EventPublisher`] that keeps every message in memory.
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    state: Arc<Mutex<State>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to `publish` fail.
    pub fn fail_publishes(&self, n: usize) {
        self.state.lock().failing_publishes = n;
    }

    /// Makes the next `n` calls to `ensure_topic` fail.
    pub fn fail_topic_creates(&self, n: usize) {
        self.state.lock().failing_topic_creates = n;
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.state.lock().topics.iter().cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_topic_creates > 0 {
            state.failing_topic_creates -= 1;
            return Err(Error::Publish {
                context: "broker unavailable".to_string(),
            });
        }
        state.topics.insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, key: Bytes, value: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(Error::Publish {
                context: "broker unavailable".to_string(),
            });
        }
        state.messages.push(Message { key, value });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn topic_creation_recovers_within_attempt_budget() {
        let publisher = MemoryPublisher::new();
        publisher.fail_topic_creates(TOPIC_CREATE_ATTEMPTS - 1);

        ensure_topic_with_retry(
            &publisher,
            "unique-requests",
            TOPIC_CREATE_ATTEMPTS,
            TOPIC_CREATE_BACKOFF,
        )
        .await
        .unwrap();
        assert_eq!(publisher.topics(), vec!["unique-requests".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn topic_creation_gives_up_after_attempt_budget() {
        let publisher = MemoryPublisher::new();
        publisher.fail_topic_creates(TOPIC_CREATE_ATTEMPTS);

        let err = ensure_topic_with_retry(
            &publisher,
            "unique-requests",
            TOPIC_CREATE_ATTEMPTS,
            TOPIC_CREATE_BACKOFF,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
        assert!(publisher.topics().is_empty());
    }

    #[tokio::test]
    async fn publish_failures_do_not_record_messages() {
        let publisher = MemoryPublisher::new();
        publisher.fail_publishes(1);

        assert!(
            publisher
                .publish(Bytes::new(), Bytes::from_static(b"1"))
                .await
                .is_err()
        );
        publisher
            .publish(Bytes::new(), Bytes::from_static(b"2"))
            .await
            .unwrap();

        let messages = publisher.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].value, Bytes::from_static(b"2"));
    }
}
