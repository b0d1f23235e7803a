use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use mentora_schema::AppError;

/// Response-side wrapper mapping error kinds to HTTP statuses. Every
/// failure body is `{error, detail}` with a user-safe detail.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(err.into())
    }
}

fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
        AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AppError::Conflict(_) => StatusCode::CONFLICT,
        AppError::ProviderUnconfigured(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::ProviderTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::ProviderFatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        AppError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), detail = self.0.detail(), "request failed");
        } else {
            tracing::debug!(kind = self.0.kind(), detail = self.0.detail(), "request rejected");
        }

        let body = Json(serde_json::json!({
            "error": self.0.kind(),
            "detail": self.0.detail(),
        }));

        let mut response = (status, body).into_response();
        if matches!(self.0, AppError::ResourceExhausted(_)) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
