use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use verve_core::AppError;

/// Thin wrapper so the HTTP layer owns the `AppError -> Response` mapping
/// without `verve-core` needing to depend on axum. Grounded on the *intent*
/// of `orch-web/src/error.rs`'s `WebError`, but using `AppError`'s own tag
/// directly instead of re-deriving a parallel variant set.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Invalid(_) => StatusCode::BAD_REQUEST,
            AppError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "code": self.0.tag(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
