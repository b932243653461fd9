//! # Request and Event Records
//!
//! Plain data carried between the accept path, the worker pool, the endpoint
//! forwarder and the aggregator.
//!
//! - [`AcceptRequest`] - one inbound accept call, validated on construction.
//! - [`ForwardJob`] - an outbound call scheduled by a shard's forward trigger.
//! - [`AggregateEvent`] - the per-window distinct count published to the
//!   message queue.
//!
//! Aggregate events are JSON encoded. `event_time` is written as an RFC 3339
//! timestamp with full sub-second precision, so a decoded event compares
//! equal to the one that was encoded.

use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the query parameter carrying the distinct count on forwarded
/// calls.
pub const COUNT_PARAM: &str = "count";

/// A single accepted request.
///
/// Immutable once built. The dispatcher wraps it in an `Arc` so that both
/// consumers of a shard can hold it without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptRequest {
    id: String,
    endpoint: Option<String>,
}

impl AcceptRequest {
    /// Builds a request, rejecting an empty `id`.
    ///
    /// An empty `endpoint` is treated the same as an absent one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if `id` is empty.
    pub fn new(id: impl Into<String>, endpoint: Option<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidRequest {
                reason: "Missing 'id' parameter".to_string(),
            });
        }

        Ok(Self {
            id,
            endpoint: endpoint.filter(|e| !e.is_empty()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

/// An outbound call to a caller-supplied endpoint with the distinct count
/// observed when the job was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardJob {
    pub id: String,
    pub endpoint: String,
    pub count: u64,
}

/// Distinct request count for one aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateEvent {
    pub unique_request_count: i64,
    pub event_time: DateTime<Utc>,
}

impl AggregateEvent {
    pub fn new(unique_request_count: u64, event_time: DateTime<Utc>) -> Self {
        Self {
            unique_request_count: i64::try_from(unique_request_count).unwrap_or(i64::MAX),
            event_time,
        }
    }

    /// Encodes the event as the JSON payload sent to the message queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes an event previously produced by [`AggregateEvent::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the payload is not a valid event.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
