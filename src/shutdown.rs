use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Listen for SIGTERM and SIGINT.
///
/// The returned token is cancelled on the first of either. The HTTP server
/// and the orchestrator both watch it: the listener stops accepting, the
/// workers stop taking queue items and in-flight jobs get the shutdown grace
/// period to finish.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = trigger.cancelled() => return,
        };
        tracing::info!(signal = name, "Received shutdown signal, draining");
        trigger.cancel();
    });

    Ok(token)
}
