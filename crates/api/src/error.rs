//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use orders::ValidationError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Malformed request (bad identifier, bad body).
    BadRequest(String),
    /// Input failed validation at ingress.
    Validation(ValidationError),
    /// Saga or storage failure.
    Saga(SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Validation(err) => {
                (StatusCode::BAD_REQUEST, "VALIDATION", err.to_string())
            }
            ApiError::Saga(SagaError::OrderNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("order not found: {id}"),
            ),
            ApiError::Saga(err) => {
                tracing::error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    err.to_string(),
                )
            }
        };

        let body = serde_json::json!({ "code": code, "details": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::Validation(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}
