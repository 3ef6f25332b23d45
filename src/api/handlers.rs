//! HTTP route handlers for the status API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

use super::types::{ConnectionInfo, RegistrySnapshot};
use crate::worker::{ServiceId, WorkerHandle};

/// GET /connections - snapshot of every managed tunnel.
pub async fn connections(State(worker): State<WorkerHandle>) -> Json<RegistrySnapshot> {
    let connections = worker
        .connections()
        .into_iter()
        .map(ConnectionInfo::from)
        .collect();

    Json(RegistrySnapshot { connections })
}

/// GET /connections/{namespace}/{name} - one tunnel, if managed.
pub async fn connection(
    State(worker): State<WorkerHandle>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ConnectionInfo>, StatusCode> {
    worker
        .get(&ServiceId::new(name, namespace))
        .map(|conn| Json(ConnectionInfo::from(conn)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /healthz - liveness probe.
pub async fn healthz() -> &'static str {
    "ok"
}
