//! Sync status and trigger endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use flowslide_core::deployment::{TriggerReport, TypeStatusReport};
use flowslide_core::store::DataType;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub data_type: Option<DataType>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<Vec<TypeStatusReport>> {
    Json(state.deployment().get_status())
}

pub async fn trigger(
    State(state): State<AppState>,
    request: Option<Json<TriggerRequest>>,
) -> ApiResult<Json<Vec<TriggerReport>>> {
    let data_type = request.and_then(|Json(r)| r.data_type);
    let reports = state.deployment().trigger_sync(data_type).await?;
    Ok(Json(reports))
}
