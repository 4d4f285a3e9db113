//! API error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flowslide_core::CoreError;
use serde_json::json;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Wrapper turning core errors into structured HTTP responses.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            CoreError::InvalidConfig { .. } => (StatusCode::BAD_REQUEST, "invalid_config"),
            CoreError::UsernameConflict(_) => (StatusCode::CONFLICT, "username_conflict"),
            CoreError::TransitionBusy => (StatusCode::CONFLICT, "transition_busy"),
            CoreError::UniquenessUnverifiable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "uniqueness_unverifiable")
            }
            CoreError::PeerUnreachable(_) => (StatusCode::BAD_GATEWAY, "peer_unreachable"),
            CoreError::Retryable(_) => (StatusCode::SERVICE_UNAVAILABLE, "retryable"),
            CoreError::CorruptSnapshot(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "corrupt_snapshot")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let mut body = json!({
            "error": kind,
            "message": self.0.to_string(),
        });
        if let CoreError::InvalidConfig { missing } = &self.0 {
            body["missingFields"] = json!(missing);
        }
        (status, Json(body)).into_response()
    }
}
