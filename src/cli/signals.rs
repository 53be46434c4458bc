//! Signal handling for graceful shutdown
//!
//! The first SIGINT/SIGTERM cancels the token: the running node finishes,
//! no further node starts, and the run is recorded as failed.

use crate::engine::CancellationToken;

/// Wait for a shutdown signal, then cancel `token`
pub async fn setup_signal_handlers(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigint.recv() => {
                eprintln!("\nReceived SIGINT, finishing the current node...");
            }
            _ = sigterm.recv() => {
                eprintln!("\nReceived SIGTERM, finishing the current node...");
            }
        }

        token.cancel();
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        eprintln!("\nReceived Ctrl+C, finishing the current node...");
        token.cancel();
    }
}
