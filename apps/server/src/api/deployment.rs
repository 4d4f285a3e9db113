//! Deployment mode endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use flowslide_core::deployment::ModeReport;
use flowslide_core::mode::DeploymentMode;
use flowslide_core::settings::RuntimeConfig;
use flowslide_core::transition::{TransitionRecord, ValidationReport};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRequest {
    pub target_mode: DeploymentMode,
    /// Full configuration for the target mode; defaults to the currently
    /// active one.
    pub config: Option<RuntimeConfig>,
    pub reason: Option<String>,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub target_mode: DeploymentMode,
    pub config: Option<RuntimeConfig>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn get_mode(State(state): State<AppState>) -> Json<ModeReport> {
    Json(state.deployment().get_mode())
}

pub async fn switch_mode(
    State(state): State<AppState>,
    Json(request): Json<SwitchRequest>,
) -> ApiResult<Json<TransitionRecord>> {
    let service = state.deployment();
    let config = request.config.unwrap_or_else(|| service.current_config());
    let reason = request.reason.unwrap_or_else(|| "manual switch".to_string());
    let actor = request.actor.unwrap_or_else(|| "api".to_string());
    info!(target_mode = %request.target_mode, %reason, "mode switch requested");
    let record = service
        .switch_mode(request.target_mode, config, &reason, &actor)
        .await?;
    Ok(Json(record))
}

pub async fn validate(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> ApiResult<Json<ValidationReport>> {
    let service = state.deployment();
    let config = request.config.unwrap_or_else(|| service.current_config());
    Ok(Json(service.validate(request.target_mode, &config).await))
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<TransitionRecord>>> {
    let history = state
        .deployment()
        .get_history(query.limit.unwrap_or(20))
        .await?;
    Ok(Json(history))
}
