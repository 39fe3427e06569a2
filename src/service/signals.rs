use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel `cancellation` on the first shutdown signal
pub async fn setup_shutdown_handler(cancellation: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(windows)]
        {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal (Ctrl+C)");
                    cancellation.cancel();
                }
                Err(e) => {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
            }
        }

        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) = match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    cancellation.cancel();
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    cancellation.cancel();
                }
            }
        }
    });
}
