//! Sharded pool of forwarder tasks.
//!
//! Outbound calls can take up to the forward timeout each, so they run on
//! their own shards instead of inline in a worker. Jobs are queued with
//! [`ForwarderPool::try_submit`], which never waits: when a slow endpoint
//! fills a forwarder queue, further jobs for that shard are dropped and
//! logged while the forward trigger keeps draining its own queue.
//!
//! The pool's senders are owned by the forward triggers (through the
//! `Arc<ForwarderPool>`). When the last trigger exits the senders drop, the
//! forwarder queues close, and each forwarder drains what is left and stops.

use crate::server::{
    forward::client::Forward,
    telemetry::{increment_forward_errors, increment_forwards},
};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::task::TaskTracker;
use verve_core::{Error, Result, shard::ShardHasher, types::ForwardJob};

pub struct ForwarderPool {
    senders: Vec<mpsc::Sender<ForwardJob>>,
    hasher: ShardHasher,
}

impl ForwarderPool {
    /// Spawns `shards` forwarder tasks on `tracker`, each reading a bounded
    /// queue of `capacity` jobs and calling `client`.
    pub fn spawn(
        tracker: &TaskTracker,
        shards: usize,
        capacity: usize,
        hasher: ShardHasher,
        client: Arc<dyn Forward>,
    ) -> Arc<Self> {
        let mut senders = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            tracker.spawn(forward_loop(shard, rx, Arc::clone(&client)));
        }
        Arc::new(Self { senders, hasher })
    }

    /// Wraps existing queues without spawning forwarders.
    #[cfg(test)]
    pub(crate) fn from_senders(senders: Vec<mpsc::Sender<ForwardJob>>, hasher: ShardHasher) -> Self {
        Self { senders, hasher }
    }

    /// Queues `job` on the forwarder shard of its id without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::Backpressure`] if that forwarder's queue is full. The job is
    ///   not queued.
    /// - [`Error::ChannelError`] if the forwarder has already stopped.
    pub fn try_submit(&self, job: ForwardJob) -> Result<()> {
        let shard = self.hasher.shard(&job.id, self.senders.len());
        self.senders[shard].try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => Error::Backpressure { shard },
            TrySendError::Closed(_) => Error::ChannelError {
                context: format!("Forwarder {shard} channel closed"),
            },
        })
    }
}

/// Forwarder task: performs each queued call once and logs the outcome.
async fn forward_loop(shard: usize, mut rx: mpsc::Receiver<ForwardJob>, client: Arc<dyn Forward>) {
    tracing::trace!("Forwarder {shard} started");

    while let Some(job) = rx.recv().await {
        match client.forward(&job).await {
            Ok(_body) => {
                increment_forwards();
                tracing::debug!(
                    "Forwarded id {} to {} (count {}, {} byte response)",
                    job.id,
                    job.endpoint,
                    job.count,
                    _body.len()
                );
            }
            Err(e) => {
                increment_forward_errors();
                tracing::warn!("Error calling endpoint {} for id {}: {e}", job.endpoint, job.id);
            }
        }
    }

    tracing::debug!("Forwarder {shard} drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::forward::client::tests::CaptureForwarder;

    #[tokio::test]
    async fn drains_queued_jobs_when_last_sender_drops() {
        let capture = CaptureForwarder::default();
        let tracker = TaskTracker::new();
        let pool = ForwarderPool::spawn(&tracker, 3, 16, ShardHasher::Xxh3, Arc::new(capture.clone()));

        for i in 0..10 {
            pool.try_submit(ForwardJob {
                id: format!("id-{i}"),
                endpoint: "http://localhost:1/cb".to_string(),
                count: i,
            })
            .unwrap();
        }
        drop(pool);
        tracker.close();
        tracker.wait().await;

        let mut counts: Vec<u64> = capture.jobs().iter().map(|j| j.count).collect();
        counts.sort_unstable();
        assert_eq!(counts, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failing_endpoint_is_logged_and_skipped() {
        let capture = CaptureForwarder::failing();
        let tracker = TaskTracker::new();
        let pool = ForwarderPool::spawn(&tracker, 1, 4, ShardHasher::Xxh3, Arc::new(capture.clone()));

        pool.try_submit(ForwardJob {
            id: "a".to_string(),
            endpoint: "http://unreachable.invalid/cb".to_string(),
            count: 1,
        })
        .unwrap();
        drop(pool);
        tracker.close();
        tracker.wait().await;

        assert_eq!(capture.attempts(), 1);
    }

    #[test]
    fn full_queue_rejects_without_waiting() {
        // No forwarder task reads this queue.
        let (tx, rx) = mpsc::channel(1);
        let pool = ForwarderPool::from_senders(vec![tx], ShardHasher::Xxh3);
        let job = |count| ForwardJob {
            id: "slow".to_string(),
            endpoint: "http://localhost:1/cb".to_string(),
            count,
        };

        pool.try_submit(job(1)).unwrap();
        assert_eq!(pool.try_submit(job(2)), Err(Error::Backpressure { shard: 0 }));

        drop(rx);
        assert!(matches!(pool.try_submit(job(3)), Err(Error::ChannelError { .. })));
    }
}
