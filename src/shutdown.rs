use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install SIGTERM/SIGINT handlers and return the token they cancel.
///
/// The token is threaded through every state machine's driver-state I/O:
/// on shutdown, in-flight work drains through the error path and any shard
/// that already bid reports a failure to its requester before terminating.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let shutdown = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, draining shards"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, draining shards"),
        }

        shutdown.cancel();
    });

    token
}
