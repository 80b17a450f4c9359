//! Liveness of the service and of the replication loop.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::driver::DriverState;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub replication: DriverState,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// `503` once the replication loop has stopped on an error.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let replication = state.status.read().await.state;
    let (code, status) = match replication {
        DriverState::Failed => (StatusCode::SERVICE_UNAVAILABLE, "failed"),
        _ => (StatusCode::OK, "ok"),
    };
    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            replication,
        }),
    )
}

async fn root() -> &'static str {
    "Oplog Replication Service"
}
