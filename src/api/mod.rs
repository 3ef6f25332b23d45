//! Read-only HTTP status API.
//!
//! Serves a JSON snapshot of the connection registry so the state of every
//! tunnel can be inspected without touching the worker.

mod handlers;
mod types;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::worker::WorkerHandle;

/// Starts the status API server and runs it until `cancel` fires.
pub async fn serve(
    port: u16,
    worker: WorkerHandle,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/connections", get(handlers::connections))
        .route("/connections/{namespace}/{name}", get(handlers::connection))
        .route("/healthz", get(handlers::healthz))
        .with_state(worker);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!("Status API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
