use tokio::signal;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("failed to install Ctrl+C handler: {0}")]
    CtrlC(std::io::Error),
    #[cfg(unix)]
    #[error("failed to install SIGTERM handler: {0}")]
    Sigterm(std::io::Error),
}

/// Resolves when the process receives Ctrl+C or SIGTERM.
pub async fn wait_for_signal() -> Result<(), SignalError> {
    let ctrl_c = async { signal::ctrl_c().await.map_err(SignalError::CtrlC) };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(SignalError::Sigterm)?;
        let _ = sigterm.recv().await;
        Ok(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<(), SignalError>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}
