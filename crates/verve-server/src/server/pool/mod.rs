//! Sharded worker pool absorbing accepted requests.
//!
//! - [`manager`] - the dispatcher side: shard routing, bounded enqueue with
//!   timeout, closing.
//! - [`worker`] - the per-shard recorder and forward trigger tasks.

pub mod manager;
pub mod worker;
