//! Snapshot endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use tracing::warn;

use flowslide_core::snapshot::SnapshotManifest;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub backup_id: String,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<SnapshotManifest>>> {
    Ok(Json(state.deployment().list_backups().await?))
}

pub async fn create(State(state): State<AppState>) -> ApiResult<Json<SnapshotManifest>> {
    Ok(Json(state.deployment().create_backup().await?))
}

pub async fn restore(
    State(state): State<AppState>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<Json<SnapshotManifest>> {
    warn!(backup_id = %request.backup_id, "restore requested; the process will exit for restart");
    Ok(Json(state.deployment().restore(&request.backup_id).await?))
}
