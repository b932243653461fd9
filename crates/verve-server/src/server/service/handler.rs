//! The accept service and its lifecycle.
//!
//! [`VerveService`] wires the dispatcher, the per-shard recorders and forward
//! triggers, the forwarder pool and the aggregator together. It is cheap to
//! clone and every clone refers to the same running instance, which is how
//! the HTTP layer shares it between handlers.
//!
//! ## Shutdown
//!
//! [`VerveService::shutdown`] runs the ordered teardown:
//!
//! 1. stop admitting accept calls,
//! 2. close every shard queue,
//! 3. cancel the aggregator,
//! 4. wait for every recorder, trigger, forwarder and the aggregator to exit,
//! 5. close the store and publisher.
//!
//! Everything enqueued before step 2 is processed before step 4 returns.

use crate::server::{
    aggregator::Aggregator,
    config::{DispatchMode, ServerConfig},
    forward::{client::Forward, pool::ForwarderPool},
    pool::{
        manager::{WorkerPool, shard_channels},
        worker::{RecordTarget, recorder_loop, trigger_loop},
    },
    telemetry::{increment_accepted, increment_rejected},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use verve_core::{
    Error, Result,
    publisher::{EventPublisher, TOPIC_CREATE_ATTEMPTS, TOPIC_CREATE_BACKOFF, ensure_topic_with_retry},
    store::CounterStore,
    types::AcceptRequest,
};

#[derive(Clone)]
pub struct VerveService {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    /// `None` in [`DispatchMode::Direct`].
    pool: Option<WorkerPool>,
    store: Arc<dyn CounterStore>,
    publisher: Arc<dyn EventPublisher>,
    tracker: TaskTracker,
    aggregator_stop: CancellationToken,
    admitting: AtomicBool,
    shutdown_started: AtomicBool,
}

impl VerveService {
    /// Ensures the topic exists, then spawns every background task.
    ///
    /// In pooled mode each of the `num_workers` shards gets a recorder, a
    /// forward trigger and a forwarder. The aggregator runs in both modes.
    ///
    /// # Errors
    ///
    /// Returns the last topic creation error if the topic could not be
    /// created within the retry budget. Nothing is spawned in that case.
    pub async fn start(
        config: ServerConfig,
        store: Arc<dyn CounterStore>,
        publisher: Arc<dyn EventPublisher>,
        forwarder: Arc<dyn Forward>,
    ) -> Result<Self> {
        ensure_topic_with_retry(
            publisher.as_ref(),
            &config.topic,
            TOPIC_CREATE_ATTEMPTS,
            TOPIC_CREATE_BACKOFF,
        )
        .await?;

        let tracker = TaskTracker::new();

        let pool = match config.dispatch_mode {
            DispatchMode::Pooled => {
                let forwarders = ForwarderPool::spawn(
                    &tracker,
                    config.num_workers,
                    config.channel_buffer_size,
                    config.shard_hasher,
                    forwarder,
                );

                let (senders, receivers) =
                    shard_channels(config.num_workers, config.channel_buffer_size);
                let target = RecordTarget {
                    store: Arc::clone(&store),
                    set_key: config.request_set_key.clone(),
                    retries: config.record_retries,
                    backoff: config.record_retry_backoff,
                };
                for (shard, rx) in receivers.into_iter().enumerate() {
                    tracker.spawn(recorder_loop(shard, rx.record, target.clone()));
                    tracker.spawn(trigger_loop(
                        shard,
                        rx.trigger,
                        Arc::clone(&store),
                        config.request_set_key.clone(),
                        Arc::clone(&forwarders),
                    ));
                }

                Some(WorkerPool::new(
                    senders,
                    config.shard_hasher,
                    config.dispatch_timeout,
                ))
            }
            DispatchMode::Direct => None,
        };

        let aggregator_stop = CancellationToken::new();
        let aggregator = Aggregator::new(&config, Arc::clone(&store), Arc::clone(&publisher));
        tracker.spawn(aggregator.run(aggregator_stop.clone()));

        tracing::info!(
            "Started {} shards in {:?} mode, aggregating every {:?}",
            config.num_workers,
            config.dispatch_mode,
            config.aggregation_interval
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                store,
                publisher,
                tracker,
                aggregator_stop,
                admitting: AtomicBool::new(true),
                shutdown_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Accepts one request id.
    ///
    /// In pooled mode the id is only enqueued; recording and forwarding
    /// happen asynchronously on its shard. In direct mode the per-id counter
    /// is incremented before returning and `endpoint` is ignored.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if `id` is empty.
    /// - [`Error::Backpressure`] if the shard queue stayed full.
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    /// - [`Error::Store`] if the direct-mode increment fails.
    #[cfg_attr(feature = "otel", tracing::instrument(skip(self)))]
    pub async fn accept(&self, id: &str, endpoint: Option<String>) -> Result<()> {
        let result = self.try_accept(id, endpoint).await;
        match &result {
            Ok(()) => increment_accepted(),
            Err(e) => {
                increment_rejected();
                tracing::debug!("Rejected id {id:?}: {e}");
            }
        }
        result
    }

    async fn try_accept(&self, id: &str, endpoint: Option<String>) -> Result<()> {
        let request = AcceptRequest::new(id, endpoint)?;
        if !self.is_admitting() {
            return Err(Error::ServiceShutdown);
        }

        match &self.inner.pool {
            Some(pool) => pool.dispatch(request).await.map(|_shard| ()),
            None => {
                if let Some(endpoint) = request.endpoint() {
                    tracing::info!("Ignoring endpoint {endpoint} for id {}", request.id());
                }
                let key = format!("{}{}", self.inner.config.req_id_prefix, request.id());
                self.inner.store.incr(&key).await.map(|_count| ())
            }
        }
    }

    /// Returns the shard `id` is routed to, or `None` in direct mode.
    pub fn shard_for(&self, id: &str) -> Option<usize> {
        self.inner.pool.as_ref().map(|pool| pool.shard_for(id))
    }

    pub fn is_admitting(&self) -> bool {
        self.inner.admitting.load(Ordering::Acquire)
    }

    /// Rejects every later accept call with [`Error::ServiceShutdown`]
    /// without closing the queues yet.
    pub fn stop_admitting(&self) {
        self.inner.admitting.store(false, Ordering::Release);
        if let Some(pool) = &self.inner.pool {
            pool.stop_admitting();
        }
    }

    /// Runs the ordered shutdown described in the module docs.
    ///
    /// Only the first call does any work; later calls return `Ok` at once.
    ///
    /// # Errors
    ///
    /// Returns the store's close error, or else the publisher's.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("Shutting down");

        self.stop_admitting();
        if let Some(pool) = &self.inner.pool {
            pool.close();
        }
        self.inner.aggregator_stop.cancel();

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::debug!("All workers drained");

        let store = self.inner.store.close().await;
        if let Err(e) = &store {
            tracing::error!("Error closing store: {e}");
        }
        let publisher = self.inner.publisher.close().await;
        if let Err(e) = &publisher {
            tracing::error!("Error closing publisher: {e}");
        }

        tracing::info!("Shutdown complete");
        store.and(publisher)
    }
}
