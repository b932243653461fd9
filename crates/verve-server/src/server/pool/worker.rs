use crate::server::{
    forward::pool::ForwarderPool,
    pool::manager::ShardItem,
    telemetry::{increment_forwards_dropped, increment_record_errors, increment_recorded},
};
use core::time::Duration;
use std::sync::Arc;
use tokio::{sync::mpsc, time::sleep};
use verve_core::{Error, Result, store::CounterStore, types::ForwardJob};

/// Where and how a recorder writes ids.
#[derive(Clone)]
pub struct RecordTarget {
    pub store: Arc<dyn CounterStore>,
    pub set_key: String,
    pub retries: usize,
    pub backoff: Duration,
}

impl RecordTarget {
    /// Adds `id` to the window set, retrying failed attempts. `SADD` is
    /// idempotent so a retry after an ambiguous failure cannot double count.
    async fn record(&self, id: &str) -> Result<bool> {
        let mut attempt = 0;
        loop {
            match self.store.set_add(&self.set_key, id).await {
                Ok(added) => return Ok(added),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    tracing::debug!("Retrying id {id} ({attempt}/{}): {e}", self.retries);
                    sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Recorder task for one shard.
///
/// Adds every received id to the window set. An id that still fails after the
/// configured retries is logged and abandoned; the recorder keeps consuming so
/// a store outage never wedges the shard. Returns the number of items taken
/// off the queue once it is closed and drained.
pub async fn recorder_loop(
    shard: usize,
    mut rx: mpsc::Receiver<ShardItem>,
    target: RecordTarget,
) -> usize {
    tracing::trace!("Recorder {shard} started");
    let mut received = 0;

    while let Some(request) = rx.recv().await {
        received += 1;
        match target.record(request.id()).await {
            Ok(_added) => {
                increment_recorded();
                tracing::trace!("Recorder {shard} stored id {} (new: {_added})", request.id());
            }
            Err(e) => {
                increment_record_errors();
                tracing::error!(
                    "Failed adding id {} to the window set on shard {shard}: {e}",
                    request.id()
                );
            }
        }
    }

    tracing::debug!("Recorder {shard} drained after {received} requests");
    received
}

/// Forward trigger task for one shard.
///
/// For each request carrying an endpoint, reads the current distinct count and
/// hands a [`ForwardJob`] to the forwarder pool. The count may be slightly
/// older or newer than the request's own insertion, since the recorder of the
/// same shard runs independently. Handing off never waits; a job whose
/// forwarder queue is full is logged and dropped.
pub async fn trigger_loop(
    shard: usize,
    mut rx: mpsc::Receiver<ShardItem>,
    store: Arc<dyn CounterStore>,
    set_key: String,
    forwarder: Arc<ForwarderPool>,
) {
    tracing::trace!("Forward trigger {shard} started");

    while let Some(request) = rx.recv().await {
        let Some(endpoint) = request.endpoint() else {
            continue;
        };

        let count = match store.set_card(&set_key).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Failed to fetch unique request count on shard {shard}: {e}");
                continue;
            }
        };

        let job = ForwardJob {
            id: request.id().to_string(),
            endpoint: endpoint.to_string(),
            count,
        };
        match forwarder.try_submit(job) {
            Ok(()) => {}
            Err(Error::Backpressure { shard: target }) => {
                increment_forwards_dropped();
                tracing::warn!(
                    "Forwarder {target} is full, dropping call to {endpoint} for id {}",
                    request.id()
                );
            }
            Err(e) => tracing::warn!("Forward trigger {shard} could not submit job: {e}"),
        }
    }

    tracing::debug!("Forward trigger {shard} drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::forward::client::tests::CaptureForwarder;
    use verve_core::{shard::ShardHasher, store::MemoryStore, types::AcceptRequest};

    fn item(id: &str, endpoint: Option<&str>) -> ShardItem {
        Arc::new(AcceptRequest::new(id, endpoint.map(str::to_string)).unwrap())
    }

    fn target(store: &MemoryStore, retries: usize) -> RecordTarget {
        RecordTarget {
            store: Arc::new(store.clone()),
            set_key: "REQUEST_IDS".to_string(),
            retries,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn recorder_drains_queue_before_exiting() {
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::channel(64);
        for i in 0..50 {
            tx.send(item(&format!("id-{}", i % 20), None)).await.unwrap();
        }
        drop(tx);

        let received = recorder_loop(0, rx, target(&store, 0)).await;
        assert_eq!(received, 50);
        assert_eq!(store.set_card("REQUEST_IDS").await.unwrap(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_retries_transient_store_failures() {
        let store = MemoryStore::new();
        store.inject_failures(2);
        let (tx, rx) = mpsc::channel(1);
        tx.send(item("a", None)).await.unwrap();
        drop(tx);

        recorder_loop(0, rx, target(&store, 2)).await;
        assert!(store.members("REQUEST_IDS").contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_abandons_item_and_keeps_consuming() {
        let store = MemoryStore::new();
        store.inject_failures(2);
        let (tx, rx) = mpsc::channel(4);
        tx.send(item("lost", None)).await.unwrap();
        tx.send(item("kept", None)).await.unwrap();
        drop(tx);

        let received = recorder_loop(0, rx, target(&store, 1)).await;
        assert_eq!(received, 2);
        let members = store.members("REQUEST_IDS");
        assert!(!members.contains("lost"));
        assert!(members.contains("kept"));
    }

    #[tokio::test]
    async fn trigger_forwards_with_current_count() {
        let store = MemoryStore::new();
        store.set_add("REQUEST_IDS", "x").await.unwrap();
        store.set_add("REQUEST_IDS", "y").await.unwrap();

        let capture = CaptureForwarder::default();
        let tracker = tokio_util::task::TaskTracker::new();
        let forwarder = ForwarderPool::spawn(
            &tracker,
            2,
            4,
            ShardHasher::Xxh3,
            Arc::new(capture.clone()),
        );

        let (tx, rx) = mpsc::channel(4);
        tx.send(item("y", Some("http://localhost:1/cb"))).await.unwrap();
        tx.send(item("z", None)).await.unwrap();
        drop(tx);

        trigger_loop(0, rx, Arc::new(store), "REQUEST_IDS".to_string(), forwarder).await;
        tracker.close();
        tracker.wait().await;

        assert_eq!(
            capture.jobs(),
            vec![ForwardJob {
                id: "y".to_string(),
                endpoint: "http://localhost:1/cb".to_string(),
                count: 2,
            }]
        );
    }

    #[tokio::test]
    async fn trigger_drops_jobs_for_a_full_forwarder_and_keeps_draining() {
        let store = MemoryStore::new();
        let (job_tx, mut job_rx) = mpsc::channel(1);
        let forwarder = Arc::new(ForwarderPool::from_senders(vec![job_tx], ShardHasher::Xxh3));

        let (tx, rx) = mpsc::channel(8);
        for i in 0..5 {
            tx.send(item(&format!("id-{i}"), Some("http://localhost:1/cb")))
                .await
                .unwrap();
        }
        drop(tx);

        // Nothing reads the forwarder queue, yet the trigger still finishes.
        trigger_loop(0, rx, Arc::new(store), "REQUEST_IDS".to_string(), forwarder).await;

        assert_eq!(job_rx.recv().await.unwrap().id, "id-0");
        assert!(job_rx.recv().await.is_none());
    }
}
