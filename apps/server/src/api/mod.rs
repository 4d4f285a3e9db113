//! Route table of the control facade.

pub mod backup;
pub mod deployment;
pub mod sync;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/deployment/mode", get(deployment::get_mode))
        .route("/api/deployment/switch", post(deployment::switch_mode))
        .route("/api/deployment/validate", post(deployment::validate))
        .route("/api/deployment/history", get(deployment::get_history))
        .route("/api/database/sync/status", get(sync::get_status))
        .route("/api/database/sync/trigger", post(sync::trigger))
        .route("/api/backup", get(backup::list).post(backup::create))
        .route("/api/backup/restore", post(backup::restore))
        .with_state(state)
}
