#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use verve_core::{
    Result,
    publisher::MemoryPublisher,
    store::{CounterStore, MemoryStore},
    types::ForwardJob,
};
use verve_server::server::{
    config::ServerConfig, forward::client::Forward, service::handler::VerveService,
};

/// A closed valve. Everything waiting on it resumes once it is opened.
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Gate {
    pub fn closed() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub async fn pass(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// [`MemoryStore`] whose `set_add` blocks until the gate opens, standing in
/// for a stalled store connection.
#[derive(Clone)]
pub struct GatedStore {
    pub inner: MemoryStore,
    pub gate: Gate,
}

impl GatedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            gate: Gate::closed(),
        }
    }
}

#[async_trait]
impl CounterStore for GatedStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.try_acquire(key, ttl).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.gate.pass().await;
        self.inner.set_add(key, member).await
    }

    async fn set_card(&self, key: &str) -> Result<u64> {
        self.inner.set_card(key).await
    }

    async fn set_delete(&self, key: &str) -> Result<()> {
        self.inner.set_delete(key).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.inner.incr(key).await
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.scan_keys(prefix).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        self.inner.get_many(keys).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Records jobs, optionally holding every call until its gate opens.
#[derive(Clone)]
pub struct RecordingForwarder {
    jobs: Arc<Mutex<Vec<ForwardJob>>>,
    gate: Option<Gate>,
}

impl RecordingForwarder {
    pub fn new() -> Self {
        Self {
            jobs: Arc::default(),
            gate: None,
        }
    }

    pub fn stalled(gate: Gate) -> Self {
        Self {
            jobs: Arc::default(),
            gate: Some(gate),
        }
    }

    pub fn jobs(&self) -> Vec<ForwardJob> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl Forward for RecordingForwarder {
    async fn forward(&self, job: &ForwardJob) -> Result<Bytes> {
        if let Some(gate) = &self.gate {
            gate.pass().await;
        }
        self.jobs.lock().push(job.clone());
        Ok(Bytes::from_static(b"ok"))
    }
}

pub fn config(shards: usize, buffer: usize) -> ServerConfig {
    ServerConfig {
        num_workers: shards,
        channel_buffer_size: buffer,
        ..ServerConfig::default()
    }
}

pub async fn start(
    config: ServerConfig,
    store: impl CounterStore,
    publisher: &MemoryPublisher,
    forwarder: impl Forward,
) -> VerveService {
    VerveService::start(
        config,
        Arc::new(store),
        Arc::new(publisher.clone()),
        Arc::new(forwarder),
    )
    .await
    .unwrap()
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
