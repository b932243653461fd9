//! HTTP-facing service and lifecycle.
//!
//! ## Structure
//!
//! - [`handler`] - [`handler::VerveService`]: accept path, task wiring and
//!   ordered shutdown.
//! - [`routes`] - axum router exposing the accept and health endpoints.
//! - [`lifecycle`] - stop sequence bounding the listener by a deadline.

pub mod handler;
pub mod lifecycle;
pub mod routes;
