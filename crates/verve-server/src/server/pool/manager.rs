//! Sharded dispatcher in front of the worker pool.
//!
//! This module defines the [`WorkerPool`] struct, which owns the sending side
//! of every shard's queues. A request is routed to `hash(id) mod N` so that a
//! given id always lands on the same shard, and each shard executes its work
//! independently of the others.
//!
//! Every shard has two bounded queues fed with the same
//! `Arc<AcceptRequest>`: the record queue receives every request and the
//! trigger queue receives only requests carrying an endpoint. Only the record
//! queue is waited on. The trigger queue is offered the request without
//! waiting, and a full trigger queue costs the request its forwarding call,
//! never its recording.
//!
//! Closing the pool drops its senders. The receivers then yield whatever is
//! still buffered before reporting end-of-stream, which is what drains the
//! shards during shutdown.

use crate::server::telemetry::increment_forwards_dropped;
use core::time::Duration;
use parking_lot::RwLock;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::timeout,
};
use verve_core::{Error, Result, shard::ShardHasher, types::AcceptRequest};

pub type ShardItem = Arc<AcceptRequest>;

/// Sending half of one shard.
#[derive(Clone)]
pub struct ShardSender {
    record: mpsc::Sender<ShardItem>,
    trigger: mpsc::Sender<ShardItem>,
}

/// Receiving half of one shard, consumed by the shard's recorder and forward
/// trigger tasks.
pub struct ShardReceiver {
    pub record: mpsc::Receiver<ShardItem>,
    pub trigger: mpsc::Receiver<ShardItem>,
}

/// Allocates `shards` pairs of bounded queues with `capacity` slots each.
pub fn shard_channels(shards: usize, capacity: usize) -> (Vec<ShardSender>, Vec<ShardReceiver>) {
    (0..shards)
        .map(|_| {
            let (record_tx, record_rx) = mpsc::channel(capacity);
            let (trigger_tx, trigger_rx) = mpsc::channel(capacity);
            (
                ShardSender {
                    record: record_tx,
                    trigger: trigger_tx,
                },
                ShardReceiver {
                    record: record_rx,
                    trigger: trigger_rx,
                },
            )
        })
        .unzip()
}

/// Routes accepted requests onto their shard's queues.
pub struct WorkerPool {
    shards: RwLock<Option<Arc<[ShardSender]>>>,
    num_shards: usize,
    admitting: AtomicBool,
    hasher: ShardHasher,
    dispatch_timeout: Duration,
}

impl WorkerPool {
    /// Constructs a new [`WorkerPool`] from the sending halves of the shard
    /// queues.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is empty.
    pub fn new(shards: Vec<ShardSender>, hasher: ShardHasher, dispatch_timeout: Duration) -> Self {
        assert!(!shards.is_empty(), "worker pool needs at least one shard");
        Self {
            num_shards: shards.len(),
            shards: RwLock::new(Some(shards.into())),
            admitting: AtomicBool::new(true),
            hasher,
            dispatch_timeout,
        }
    }

    pub const fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Returns the shard `id` is routed to.
    pub fn shard_for(&self, id: &str) -> usize {
        self.hasher.shard(id, self.num_shards)
    }

    pub fn is_admitting(&self) -> bool {
        self.admitting.load(Ordering::Acquire)
    }

    /// Enqueues `request` on its shard and returns the shard index.
    ///
    /// Waits at most the configured dispatch timeout for a record slot. A
    /// request with an endpoint is then offered to the trigger queue; if that
    /// queue is full the forwarding call is dropped with a warning.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] if the pool no longer admits work or its
    ///   queues are closed.
    /// - [`Error::Backpressure`] if the record queue stayed full for the whole
    ///   dispatch timeout. Nothing was enqueued in that case.
    pub async fn dispatch(&self, request: AcceptRequest) -> Result<usize> {
        if !self.is_admitting() {
            return Err(Error::ServiceShutdown);
        }

        let shard = self.shard_for(request.id());
        let sender = match self.shards.read().as_ref() {
            Some(shards) => shards[shard].clone(),
            None => return Err(Error::ServiceShutdown),
        };

        let record = match timeout(self.dispatch_timeout, sender.record.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::ServiceShutdown),
            Err(_) => {
                tracing::warn!(
                    "Shard {shard} stayed full for {:?}, rejecting request",
                    self.dispatch_timeout
                );
                return Err(Error::Backpressure { shard });
            }
        };

        let request = Arc::new(request);
        record.send(Arc::clone(&request));

        if request.endpoint().is_some() {
            match sender.trigger.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(request)) => {
                    increment_forwards_dropped();
                    tracing::warn!(
                        "Trigger queue of shard {shard} is full, id {} will not be forwarded",
                        request.id()
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Trigger queue of shard {shard} closed");
                }
            }
        }
        Ok(shard)
    }

    /// Stops admitting new requests. Already reserved sends still complete.
    pub fn stop_admitting(&self) {
        self.admitting.store(false, Ordering::Release);
    }

    /// Stops admitting and drops every shard sender, closing the queues.
    ///
    /// Returns `false` if the pool was already closed.
    pub fn close(&self) -> bool {
        self.stop_admitting();
        self.shards.write().take().is_some()
    }
}
