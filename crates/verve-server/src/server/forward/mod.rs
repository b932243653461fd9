//! Best-effort forwarding of accepted requests to caller-supplied endpoints.
//!
//! - [`client`] - the [`client::Forward`] capability and its HTTP
//!   implementation.
//! - [`pool`] - the sharded forwarder tasks fed by the forward triggers.

pub mod client;
pub mod pool;
