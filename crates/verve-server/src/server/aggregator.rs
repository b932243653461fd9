//! Periodic, leader-elected aggregation of the window set.
//!
//! Every cooperating instance runs an [`Aggregator`]. On each tick they all
//! race for the global lock with a set-if-absent that expires after the lock
//! TTL; the single winner becomes this window's leader and:
//!
//! 1. reads the distinct count of the window set,
//! 2. publishes one [`AggregateEvent`],
//! 3. deletes the window set,
//! 4. logs the count to the aggregation stream.
//!
//! The lock is never released explicitly. If the leader dies mid-cycle the
//! lock simply expires and a later tick elects someone else.
//!
//! Ids recorded between steps 1 and 3 are cleared without being counted, so a
//! published count is a lower bound of what the window received.

use crate::server::{
    config::{DispatchMode, ServerConfig},
    telemetry::{AGGREGATED_TARGET, increment_aggregation_cycles, increment_leader_cycles},
};
use bytes::Bytes;
use chrono::Utc;
use core::time::Duration;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use verve_core::{
    Result, publisher::EventPublisher, store::CounterStore, types::AggregateEvent,
};

/// Result of one aggregation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// This instance held the lock and published the window's count.
    Leader { unique_request_count: u64 },
    /// This instance held the lock and reported per-id counters
    /// ([`DispatchMode::Direct`]).
    CounterReport { ids: usize },
    /// Another instance holds the lock for this window.
    Follower,
}

pub struct Aggregator {
    store: Arc<dyn CounterStore>,
    publisher: Arc<dyn EventPublisher>,
    mode: DispatchMode,
    lock_key: String,
    request_set_key: String,
    req_id_prefix: String,
    lock_ttl: Duration,
    interval: Duration,
}

impl Aggregator {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn CounterStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            publisher,
            mode: config.dispatch_mode,
            lock_key: config.lock_key.clone(),
            request_set_key: config.request_set_key.clone(),
            req_id_prefix: config.req_id_prefix.clone(),
            lock_ttl: config.lock_ttl,
            interval: config.aggregation_interval,
        }
    }

    /// Runs one cycle per interval until `shutdown` is cancelled.
    ///
    /// The first cycle runs one full interval after start. Cancellation is
    /// only observed between cycles, so an in-flight cycle always completes.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::error!("Error during aggregation: {e}");
                    }
                }
            }
        }

        tracing::debug!("Aggregator stopped");
    }

    /// Attempts to lead the current window and, if elected, aggregates it.
    ///
    /// A store error while taking the lock is logged and treated as losing
    /// the election.
    ///
    /// # Errors
    ///
    /// Returns the first failing store or publisher call of the leader step.
    /// The lock is left to expire in that case.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        increment_aggregation_cycles();

        let acquired = match self.store.try_acquire(&self.lock_key, self.lock_ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::error!("Error while acquiring global lock `{}`: {e}", self.lock_key);
                false
            }
        };
        if !acquired {
            tracing::info!("Aggregation for this window is handled by another node");
            return Ok(CycleOutcome::Follower);
        }

        increment_leader_cycles();
        match self.mode {
            DispatchMode::Pooled => self.publish_window().await,
            DispatchMode::Direct => self.report_counters().await,
        }
    }

    async fn publish_window(&self) -> Result<CycleOutcome> {
        let unique_request_count = self.store.set_card(&self.request_set_key).await?;
        let event = AggregateEvent::new(unique_request_count, Utc::now());

        // A failed publish keeps the set, so its ids roll into the next window.
        self.publisher.publish(Bytes::new(), event.to_bytes()?).await?;
        self.store.set_delete(&self.request_set_key).await?;

        tracing::info!("Total unique requests in last window: {unique_request_count}");
        tracing::info!(
            target: AGGREGATED_TARGET,
            unique_request_count,
            event_time = %event.event_time.to_rfc3339(),
            "Total unique requests in last window: {unique_request_count}"
        );

        Ok(CycleOutcome::Leader {
            unique_request_count,
        })
    }

    async fn report_counters(&self) -> Result<CycleOutcome> {
        let keys = self.store.scan_keys(&self.req_id_prefix).await?;
        let counts = self.store.get_many(&keys).await?;

        let mut report = format!("Timestamp: {}\nAggregated Data:", Utc::now().to_rfc3339());
        let mut ids = 0;
        for (key, count) in keys.iter().zip(counts) {
            if let Some(count) = count {
                let id = key.strip_prefix(&self.req_id_prefix).unwrap_or(key);
                report.push_str(&format!("\n\tID: {id}, Count: {count}"));
                ids += 1;
            }
        }

        tracing::info!(target: AGGREGATED_TARGET, "{report}");
        tracing::info!("Reported counters for {ids} ids");
        Ok(CycleOutcome::CounterReport { ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verve_core::{publisher::MemoryPublisher, store::MemoryStore};

    fn aggregator(store: &MemoryStore, publisher: &MemoryPublisher) -> Aggregator {
        Aggregator::new(
            &ServerConfig::default(),
            Arc::new(store.clone()),
            Arc::new(publisher.clone()),
        )
    }

    async fn seed(store: &MemoryStore, ids: &[&str]) {
        for id in ids {
            store.set_add("REQUEST_IDS", id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn leader_publishes_count_and_clears_window() {
        let store = MemoryStore::new();
        let publisher = MemoryPublisher::new();
        seed(&store, &["a", "bb", "ccc"]).await;

        let outcome = aggregator(&store, &publisher).run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Leader {
                unique_request_count: 3
            }
        );

        let messages = publisher.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].key.is_empty());
        let event = AggregateEvent::from_slice(&messages[0].value).unwrap();
        assert_eq!(event.unique_request_count, 3);
        assert_eq!(store.set_card("REQUEST_IDS").await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_instances_elect_a_single_leader() {
        let store = MemoryStore::new();
        let publisher = MemoryPublisher::new();
        seed(&store, &["x", "y"]).await;

        let first = aggregator(&store, &publisher);
        let second = aggregator(&store, &publisher);
        let (a, b) = tokio::join!(first.run_cycle(), second.run_cycle());
        let outcomes = [a.unwrap(), b.unwrap()];

        let leaders = outcomes
            .iter()
            .filter(|o| matches!(o, CycleOutcome::Leader { .. }))
            .count();
        assert_eq!(leaders, 1);
        assert!(outcomes.contains(&CycleOutcome::Follower));
        assert_eq!(publisher.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lock_expires_instead_of_blocking_forever() {
        let store = MemoryStore::new();
        let publisher = MemoryPublisher::new();
        // A previous leader took the lock and died.
        store
            .try_acquire("AGGREGATOR_LOCK", Duration::from_secs(60))
            .await
            .unwrap();

        let agg = aggregator(&store, &publisher);
        assert_eq!(agg.run_cycle().await.unwrap(), CycleOutcome::Follower);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(matches!(
            agg.run_cycle().await.unwrap(),
            CycleOutcome::Leader { .. }
        ));
    }

    #[tokio::test]
    async fn failed_publish_keeps_window_for_next_cycle() {
        let store = MemoryStore::new();
        let publisher = MemoryPublisher::new();
        seed(&store, &["a", "b"]).await;
        publisher.fail_publishes(1);

        assert!(aggregator(&store, &publisher).run_cycle().await.is_err());
        assert_eq!(store.set_card("REQUEST_IDS").await.unwrap(), 2);
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test]
    async fn lock_store_error_counts_as_follower() {
        let store = MemoryStore::new();
        let publisher = MemoryPublisher::new();
        store.inject_failures(1);

        let outcome = aggregator(&store, &publisher).run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Follower);
    }

    #[tokio::test]
    async fn direct_mode_reports_per_id_counters() {
        let store = MemoryStore::new();
        let publisher = MemoryPublisher::new();
        store.incr("REQ_ID:a").await.unwrap();
        store.incr("REQ_ID:a").await.unwrap();
        store.incr("REQ_ID:b").await.unwrap();

        let config = ServerConfig {
            dispatch_mode: DispatchMode::Direct,
            ..ServerConfig::default()
        };
        let agg = Aggregator::new(&config, Arc::new(store.clone()), Arc::new(publisher.clone()));

        assert_eq!(
            agg.run_cycle().await.unwrap(),
            CycleOutcome::CounterReport { ids: 2 }
        );
        assert!(publisher.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_once_per_interval_until_cancelled() {
        let store = MemoryStore::new();
        let publisher = MemoryPublisher::new();
        seed(&store, &["a"]).await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(aggregator(&store, &publisher).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(publisher.messages().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(publisher.messages().len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
