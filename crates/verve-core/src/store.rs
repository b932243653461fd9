//! Shared counter store capability.
//!
//! The accept service keeps all cross-process state in one external
//! key/value + set store: the window's distinct-id set, the aggregator's
//! global lock and, for the direct dispatch mode, a per-id counter map. Only
//! the operations below are used, which keeps any store offering an atomic
//! set-if-absent-with-expiry and set primitives (Redis, Valkey, KeyDB, ...)
//! pluggable behind [`CounterStore`].
//!
//! [`MemoryStore`] is an in-process implementation. Cloning it shares the
//! underlying state, so several service instances handed clones of the same
//! store cooperate exactly like processes sharing one remote store.

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::time::{Duration, Instant};

/// Operations the service consumes from the shared store.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Sets `key` only if it is absent, with a time-to-live of `ttl`.
    ///
    /// Returns `true` if this call created the key, i.e. the caller now holds
    /// the lock until it expires.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Adds `member` to the set at `key`. Returns `true` if it was not yet a
    /// member.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns the cardinality of the set at `key` (zero if absent).
    async fn set_card(&self, key: &str) -> Result<u64>;

    /// Deletes the set at `key`.
    async fn set_delete(&self, key: &str) -> Result<()>;

    /// Increments the counter at `key`, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Lists every live key starting with `prefix`.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Reads many counters in one round trip. Missing or non-counter keys
    /// yield `None` at their position.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>>;

    /// Releases the connection. Further calls may fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum Value {
    Flag,
    Counter(i64),
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    injected_failures: usize,
    closed: bool,
}

impl State {
    fn check(&mut self, op: &str) -> Result<()> {
        if self.closed {
            return Err(Error::Store {
                context: format!("{op}: store is closed"),
            });
        }
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(Error::Store {
                context: format!("{op}: injected failure"),
            });
        }
        Ok(())
    }

    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

fn wrong_type(op: &str, key: &str) -> Error {
    Error::Store {
        context: format!("{op}: key `{key}` holds the wrong kind of value"),
    }
}

/// In-process [`CounterStore`].
///
/// Expiry is measured with [`tokio::time::Instant`], so tests running on a
/// paused runtime can advance lock TTLs deterministically.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` operations fail with [`Error::Store`].
    pub fn inject_failures(&self, n: usize) {
        self.state.lock().injected_failures = n;
    }

    /// Returns `true` if `key` exists and has not expired.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().live(key, Instant::now()).is_some()
    }

    /// Snapshot of the members of the set at `key`.
    pub fn members(&self, key: &str) -> HashSet<String> {
        match self.state.lock().live(key, Instant::now()) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => set.clone(),
            _ => HashSet::new(),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check("SETNX")?;

        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Flag,
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check("SADD")?;

        if state.live(key, now).is_none() {
            state.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match state.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(set)) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type("SADD", key)),
        }
    }

    async fn set_card(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check("SCARD")?;

        match state.live(key, now).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Set(set)) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type("SCARD", key)),
        }
    }

    async fn set_delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check("DEL")?;
        state.entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check("INCR")?;

        if state.live(key, now).is_none() {
            state.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Counter(0),
                    expires_at: None,
                },
            );
        }
        match state.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Counter(n)) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(wrong_type("INCR", key)),
        }
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check("SCAN")?;

        state.entries.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check("MGET")?;

        Ok(keys
            .iter()
            .map(|key| match state.live(key, now).map(|e| &e.value) {
                Some(Value::Counter(n)) => Some(*n),
                _ => None,
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
