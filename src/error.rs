//! Error taxonomy
//! Mission: Map every fallible path to a stable HTTP contract

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;

/// Application-wide error type. Each variant corresponds to one of the
/// error kinds in the design: client input, auth, not-found, an optional
/// capability being disabled, or a transient/internal failure.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    ClientInput(String),

    #[error("unauthorized")]
    AuthFailure,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    OptionalUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn missing_field(name: &str) -> Self {
        AppError::ClientInput(format!("Missing required field: {name}"))
    }

    pub fn missing_param(name: &str) -> Self {
        AppError::ClientInput(format!("Missing required parameter: {name}"))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::ClientInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::AuthFailure => (
                StatusCode::UNAUTHORIZED,
                "Unauthorized: invalid or missing token".to_string(),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::OptionalUnavailable(msg) => (StatusCode::NOT_IMPLEMENTED, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "error": message,
            "timestamp": chrono::Utc::now().timestamp(),
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_variants_to_expected_status() {
        assert_eq!(
            AppError::ClientInput("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::AuthFailure.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::OptionalUnavailable("x".into())
                .into_response()
                .status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            AppError::Internal("x".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
