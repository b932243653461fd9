//! Process-level stop sequence around the HTTP listener.

use crate::server::service::handler::VerveService;
use anyhow::bail;
use core::{fmt::Display, time::Duration};
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// Stops the listener and drains the service.
///
/// Admission is closed first, then `http_stop` asks the listener to finish
/// its in-flight requests. The listener gets `deadline` to exit; whether it
/// does or not, [`VerveService::shutdown`] still drains every shard.
///
/// # Errors
///
/// Returns an error if the listener was still running at the deadline. It is
/// aborted in that case.
pub async fn stop_gracefully<E: Display>(
    service: &VerveService,
    http_stop: &CancellationToken,
    mut server: JoinHandle<Result<(), E>>,
    deadline: Duration,
) -> anyhow::Result<()> {
    service.stop_admitting();
    http_stop.cancel();

    let listener_stopped = match timeout(deadline, &mut server).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(e))) => {
            tracing::error!("HTTP server error: {e}");
            true
        }
        Ok(Err(e)) => {
            tracing::error!("HTTP server task failed: {e}");
            true
        }
        Err(_) => {
            server.abort();
            false
        }
    };

    if let Err(e) = service.shutdown().await {
        tracing::error!("Error during service shutdown: {e}");
    }

    if !listener_stopped {
        tracing::error!("HTTP listener did not stop within {deadline:?}");
        bail!("HTTP listener did not stop within {deadline:?}");
    }
    Ok(())
}
