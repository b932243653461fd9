//! Types shared by the accept path, the worker pool and the aggregator.
//!
//! - [`error`] - the unified [`Error`] type and its HTTP mapping.
//! - [`types`] - request, forwarding and aggregate event records.
//! - [`shard`] - deterministic id-to-shard hashing.

pub mod error;
pub mod shard;
pub mod types;

pub use error::{Error, Result};
