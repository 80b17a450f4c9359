//! Replication progress and executor metrics.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::backend::Checkpoint;
use crate::driver::ReplicationStatus;
use crate::metrics::MetricsSnapshot;
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub replication: ReplicationStatus,
    pub metrics: MetricsSnapshot,
    /// Checkpoint as persisted by the backend
    pub last_checkpoint: Option<Checkpoint>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/stats", get(stats))
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, (StatusCode, String)> {
    let last_checkpoint = state.backend.load_checkpoint().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to load checkpoint");
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    Ok(Json(StatsResponse {
        replication: state.status.read().await.clone(),
        metrics: state.metrics.snapshot(),
        last_checkpoint,
    }))
}
