//! OS signal handling.
//!
//! [`App::listen_with_signals`](crate::App::listen_with_signals) serves
//! until SIGINT or SIGTERM arrives, then runs a graceful shutdown.

use std::io;

/// Waits for SIGTERM or SIGINT (Ctrl+C on non-Unix platforms).
///
/// Fails only when the signal handlers cannot be installed.
pub async fn wait_for_os_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "shutdown signal received"),
            _ = sigint.recv() => tracing::info!(signal = "SIGINT", "shutdown signal received"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!(signal = "ctrl-c", "shutdown signal received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waits_until_signalled() {
        let waiting = tokio::time::timeout(Duration::from_millis(50), wait_for_os_signal()).await;
        assert!(waiting.is_err(), "no signal was sent");
    }
}
