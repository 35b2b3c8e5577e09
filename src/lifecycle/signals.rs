//! OS signal handling.
//!
//! SIGINT (Ctrl+C) and, on unix, SIGTERM both request a full stop.

/// Wait until the process is asked to terminate.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received");
    Ok(())
}
