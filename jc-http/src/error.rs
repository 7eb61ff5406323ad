use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jc_core::JobControllerError;
use serde_json::json;

/// Wraps `JobControllerError` for the axum boundary. Status codes come
/// straight from `JobControllerError::status_code`; the body is always
/// `{"message": ...}`.
pub struct ApiError(pub JobControllerError);

impl From<JobControllerError> for ApiError {
    fn from(e: JobControllerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "message": self.0.to_string() }))).into_response()
    }
}
