use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use reqwest::Method;
use std::path::PathBuf;
use verve_core::shard::ShardHasher;

pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_APP_NAME: &str = "verve";
pub const DEFAULT_WORKER_POOL_SIZE: usize = 100;
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 100_000;
pub const DEFAULT_DISPATCH_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_RECORD_RETRIES: usize = 3;
pub const DEFAULT_RECORD_RETRY_BACKOFF_MS: u64 = 10;
pub const DEFAULT_LOCK_KEY: &str = "AGGREGATOR_LOCK";
pub const DEFAULT_REQUEST_SET_KEY: &str = "REQUEST_IDS";
pub const DEFAULT_REQ_ID_PREFIX: &str = "REQ_ID:";
pub const DEFAULT_TOPIC: &str = "unique-requests";
pub const DEFAULT_AGGREGATED_LOG: &str = "aggregated-data";
pub const DEFAULT_AGGREGATION_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;
pub const DEFAULT_FORWARD_METHOD: &str = "POST";
pub const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// How the accept path hands ids to the shared store.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Enqueue on the sharded worker pool; the store write happens
    /// asynchronously.
    #[default]
    Pooled,
    /// Increment a per-id counter synchronously on the accept path. The
    /// aggregator then reports per-id counts instead of a distinct count.
    Direct,
}

/// Runtime configuration for the `verve-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), and are read-only once the service starts.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "verve-server",
    version,
    about = "Accepts request ids, deduplicates them per window and publishes distinct counts"
)]
pub struct CliArgs {
    /// Address the HTTP listener binds to.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from(DEFAULT_SERVER_ADDR))]
    pub server_addr: String,

    /// Name used for the operational log file.
    ///
    /// Environment variable: `APPNAME`
    #[arg(long, env = "APPNAME", default_value_t = String::from(DEFAULT_APP_NAME))]
    pub app_name: String,

    /// Number of shards. Each shard gets a recorder, a forward trigger and a
    /// forwarder task.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[arg(long, env = "WORKER_POOL_SIZE", default_value_t = DEFAULT_WORKER_POOL_SIZE)]
    pub worker_pool_size: usize,

    /// Capacity of every per-shard queue.
    ///
    /// Environment variable: `WORKER_CHANNEL_BUFFER_SIZE`
    #[arg(long, env = "WORKER_CHANNEL_BUFFER_SIZE", default_value_t = DEFAULT_CHANNEL_BUFFER_SIZE)]
    pub channel_buffer_size: usize,

    /// How long an accept call may wait for room in a full shard queue before
    /// it is rejected as retryable.
    ///
    /// Environment variable: `DISPATCH_TIMEOUT_MS`
    #[arg(long, env = "DISPATCH_TIMEOUT_MS", default_value_t = DEFAULT_DISPATCH_TIMEOUT_MS)]
    pub dispatch_timeout_ms: u64,

    /// Extra attempts a recorder makes when adding an id to the store fails.
    ///
    /// Environment variable: `RECORD_RETRIES`
    #[arg(long, env = "RECORD_RETRIES", default_value_t = DEFAULT_RECORD_RETRIES)]
    pub record_retries: usize,

    /// Fixed delay between recorder attempts.
    ///
    /// Environment variable: `RECORD_RETRY_BACKOFF_MS`
    #[arg(long, env = "RECORD_RETRY_BACKOFF_MS", default_value_t = DEFAULT_RECORD_RETRY_BACKOFF_MS)]
    pub record_retry_backoff_ms: u64,

    /// Id-to-shard hash: `xxh3` or `length`.
    ///
    /// Environment variable: `SHARD_HASHER`
    #[arg(long, env = "SHARD_HASHER", default_value_t = ShardHasher::Xxh3)]
    pub shard_hasher: ShardHasher,

    /// Accept path strategy.
    ///
    /// Environment variable: `DISPATCH_MODE`
    #[arg(long, env = "DISPATCH_MODE", value_enum, default_value_t = DispatchMode::Pooled)]
    pub dispatch_mode: DispatchMode,

    /// Key of the aggregator's global lock.
    ///
    /// Environment variable: `AGGREGATOR_GLOBAL_LOCK`
    #[arg(long, env = "AGGREGATOR_GLOBAL_LOCK", default_value_t = String::from(DEFAULT_LOCK_KEY))]
    pub lock_key: String,

    /// Key of the set holding the current window's distinct ids.
    ///
    /// Environment variable: `REQUEST_SET_KEY`
    #[arg(long, env = "REQUEST_SET_KEY", default_value_t = String::from(DEFAULT_REQUEST_SET_KEY))]
    pub request_set_key: String,

    /// Prefix of per-id counter keys in direct mode.
    ///
    /// Environment variable: `REQ_ID`
    #[arg(long, env = "REQ_ID", default_value_t = String::from(DEFAULT_REQ_ID_PREFIX))]
    pub req_id_prefix: String,

    /// Topic aggregate events are published to.
    ///
    /// Environment variable: `KAFKA_TOPIC`
    #[arg(long, env = "KAFKA_TOPIC", default_value_t = String::from(DEFAULT_TOPIC))]
    pub topic: String,

    /// Name of the aggregation results log.
    ///
    /// Environment variable: `AGGREGATED_LOG_FILE_NAME`
    #[arg(long, env = "AGGREGATED_LOG_FILE_NAME", default_value_t = String::from(DEFAULT_AGGREGATED_LOG))]
    pub aggregated_log: String,

    /// Directory for log files. Logs go to stdout when unset.
    ///
    /// Environment variable: `LOG_DIR`
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Seconds between aggregation cycles.
    ///
    /// Environment variable: `AGGREGATION_INTERVAL_SECS`
    #[arg(long, env = "AGGREGATION_INTERVAL_SECS", default_value_t = DEFAULT_AGGREGATION_INTERVAL_SECS)]
    pub aggregation_interval_secs: u64,

    /// Expiry of the aggregator lock in seconds.
    ///
    /// Environment variable: `LOCK_TTL_SECS`
    #[arg(long, env = "LOCK_TTL_SECS", default_value_t = DEFAULT_LOCK_TTL_SECS)]
    pub lock_ttl_secs: u64,

    /// HTTP method used for forwarded calls.
    ///
    /// Environment variable: `FORWARD_METHOD`
    #[arg(long, env = "FORWARD_METHOD", default_value_t = String::from(DEFAULT_FORWARD_METHOD))]
    pub forward_method: String,

    /// Timeout of a forwarded call in seconds.
    ///
    /// Environment variable: `FORWARD_TIMEOUT_SECS`
    #[arg(long, env = "FORWARD_TIMEOUT_SECS", default_value_t = DEFAULT_FORWARD_TIMEOUT_SECS)]
    pub forward_timeout_secs: u64,

    /// Deadline for the HTTP listener to stop after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub app_name: String,
    pub num_workers: usize,
    pub channel_buffer_size: usize,
    pub dispatch_timeout: Duration,
    pub record_retries: usize,
    pub record_retry_backoff: Duration,
    pub shard_hasher: ShardHasher,
    pub dispatch_mode: DispatchMode,
    pub lock_key: String,
    pub request_set_key: String,
    pub req_id_prefix: String,
    pub topic: String,
    pub aggregated_log: String,
    pub log_dir: Option<PathBuf>,
    pub aggregation_interval: Duration,
    pub lock_ttl: Duration,
    pub forward_method: Method,
    pub forward_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            app_name: DEFAULT_APP_NAME.to_string(),
            num_workers: DEFAULT_WORKER_POOL_SIZE,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            dispatch_timeout: Duration::from_millis(DEFAULT_DISPATCH_TIMEOUT_MS),
            record_retries: DEFAULT_RECORD_RETRIES,
            record_retry_backoff: Duration::from_millis(DEFAULT_RECORD_RETRY_BACKOFF_MS),
            shard_hasher: ShardHasher::default(),
            dispatch_mode: DispatchMode::default(),
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            request_set_key: DEFAULT_REQUEST_SET_KEY.to_string(),
            req_id_prefix: DEFAULT_REQ_ID_PREFIX.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            aggregated_log: DEFAULT_AGGREGATED_LOG.to_string(),
            log_dir: None,
            aggregation_interval: Duration::from_secs(DEFAULT_AGGREGATION_INTERVAL_SECS),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            forward_method: Method::POST,
            forward_timeout: Duration::from_secs(DEFAULT_FORWARD_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.worker_pool_size == 0 {
            bail!("WORKER_POOL_SIZE must be greater than 0");
        }
        if args.channel_buffer_size == 0 {
            bail!("WORKER_CHANNEL_BUFFER_SIZE must be greater than 0");
        }
        if args.dispatch_timeout_ms == 0 {
            bail!("DISPATCH_TIMEOUT_MS must be greater than 0");
        }
        if args.aggregation_interval_secs == 0 {
            bail!("AGGREGATION_INTERVAL_SECS must be greater than 0");
        }
        if args.lock_ttl_secs == 0 {
            bail!("LOCK_TTL_SECS must be greater than 0");
        }
        if args.forward_timeout_secs == 0 {
            bail!("FORWARD_TIMEOUT_SECS must be greater than 0");
        }
        if args.shutdown_timeout_secs == 0 {
            bail!("SHUTDOWN_TIMEOUT_SECS must be greater than 0");
        }
        for (name, value) in [
            ("AGGREGATOR_GLOBAL_LOCK", &args.lock_key),
            ("REQUEST_SET_KEY", &args.request_set_key),
            ("KAFKA_TOPIC", &args.topic),
            ("AGGREGATED_LOG_FILE_NAME", &args.aggregated_log),
        ] {
            if value.trim().is_empty() {
                bail!("{name} must not be empty");
            }
        }
        if args.lock_key == args.request_set_key {
            bail!("AGGREGATOR_GLOBAL_LOCK and REQUEST_SET_KEY must be different keys");
        }

        let forward_method = Method::from_bytes(args.forward_method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid FORWARD_METHOD `{}`", args.forward_method))?;

        Ok(Self {
            server_addr: args.server_addr,
            app_name: args.app_name,
            num_workers: args.worker_pool_size,
            channel_buffer_size: args.channel_buffer_size,
            dispatch_timeout: Duration::from_millis(args.dispatch_timeout_ms),
            record_retries: args.record_retries,
            record_retry_backoff: Duration::from_millis(args.record_retry_backoff_ms),
            shard_hasher: args.shard_hasher,
            dispatch_mode: args.dispatch_mode,
            lock_key: args.lock_key,
            request_set_key: args.request_set_key,
            req_id_prefix: args.req_id_prefix,
            topic: args.topic,
            aggregated_log: args.aggregated_log,
            log_dir: args.log_dir,
            aggregation_interval: Duration::from_secs(args.aggregation_interval_secs),
            lock_ttl: Duration::from_secs(args.lock_ttl_secs),
            forward_method,
            forward_timeout: Duration::from_secs(args.forward_timeout_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}
