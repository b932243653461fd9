//! Error types for the accept service.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure in the dispatch, recording, forwarding
//! and aggregation paths. It implements [`IntoResponse`] so the HTTP layer can
//! surface an error to the caller with an appropriate status code.
//!
//! ## Error Cases
//! - `InvalidRequest`: The accept request was malformed (e.g. missing `id`).
//! - `Backpressure`: The target shard stayed full for the whole dispatch
//!   timeout. Retryable.
//! - `ServiceShutdown`: A request arrived after the pool stopped admitting
//!   work.
//! - `ChannelError`: An internal communication failure between tasks.
//! - `Store`: The shared counter store rejected or failed an operation.
//! - `Publish`: The event publisher failed to emit a message.
//! - `Forward`: An outbound endpoint call failed.
//! - `Serialization`: An aggregate event could not be encoded or decoded.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the accept service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The shard's queue had no free capacity within the dispatch timeout.
    #[error("Shard {shard} is saturated, retry later")]
    Backpressure { shard: usize },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A shared store operation failed.
    #[error("Store error: {context}")]
    Store { context: String },

    /// Publishing to the message queue failed.
    #[error("Publish error: {context}")]
    Publish { context: String },

    /// An outbound endpoint call failed.
    #[error("Forward error: {context}")]
    Forward { context: String },

    /// Encoding or decoding an event failed.
    #[error("Serialization error: {context}")]
    Serialization { context: String },
}

impl Error {
    /// Returns `true` for conditions a caller may retry unchanged.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure { .. } | Self::ServiceShutdown)
    }

    /// The HTTP status code this error maps to on the accept path.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Backpressure { .. } | Self::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Forward { .. } => StatusCode::BAD_GATEWAY,
            Self::ChannelError { .. }
            | Self::Store { .. }
            | Self::Publish { .. }
            | Self::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            context: err.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_retryable() {
            (status, [(header::RETRY_AFTER, "1")], self.to_string()).into_response()
        } else {
            (status, self.to_string()).into_response()
        }
    }
}
