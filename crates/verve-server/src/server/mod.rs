pub mod aggregator;
pub mod config;
pub mod forward;
pub mod pool;
pub mod publisher;
pub mod service;
pub mod telemetry;
