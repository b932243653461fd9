use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use verve_core::store::MemoryStore;
use verve_server::server::{
    config::{CliArgs, ServerConfig},
    forward::client::HttpForwarder,
    publisher::LogPublisher,
    service::{handler::VerveService, lifecycle::stop_gracefully, routes::router},
    telemetry::init_telemetry,
};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry(&config)?;
    log_startup_info(&config);

    let forwarder = HttpForwarder::new(config.forward_method.clone(), config.forward_timeout)?;
    let service = VerveService::start(
        config.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(LogPublisher::new(config.topic.clone())),
        Arc::new(forwarder),
    )
    .await
    .context("failed to start service")?;

    let listener = TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;

    let http_stop = CancellationToken::new();
    let server = tokio::spawn({
        let app = router(service.clone());
        let stop = http_stop.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }
    });

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, terminating gracefully...");

    let stopped = stop_gracefully(&service, &http_stop, server, config.shutdown_timeout).await;
    providers.shutdown();
    stopped?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting accept service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting accept service on {} with {} shards",
            config.server_addr,
            config.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
