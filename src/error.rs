//! Error types for the sync server

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Compare-and-set miss on a versioned entity. The coordinator turns this
    /// into a conflict record instead of failing the request.
    #[error("Version conflict on {entity_id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) | Self::VersionConflict { .. } => StatusCode::CONFLICT,
            Self::Persistence(_) | Self::Serialization(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            AppError::Persistence(e) => {
                tracing::error!("Database error: {}", e);
                "Database error".to_string()
            }
            AppError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                "Failed to encode sync data".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            success: false,
            error: message,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let caller_errors = [
            (AppError::validation("bad"), StatusCode::BAD_REQUEST),
            (
                AppError::Unauthorized("no identity".to_string()),
                StatusCode::UNAUTHORIZED,
            ),
            (AppError::not_found("conflict 1"), StatusCode::NOT_FOUND),
            (
                AppError::invalid_state("already resolved"),
                StatusCode::CONFLICT,
            ),
            (
                AppError::VersionConflict {
                    entity_id: "task-1".to_string(),
                    expected: 1,
                    actual: 2,
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, expected) in caller_errors {
            assert_eq!(err.status_code(), expected, "{}", err);
            assert!(err.status_code().is_client_error());
        }

        // Server-side failures are 500, not 4xx
        let server_errors = [
            AppError::Persistence(sqlx::Error::PoolTimedOut),
            AppError::Serialization(serde_json::from_str::<i64>("x").unwrap_err()),
            AppError::Internal("corrupt row".to_string()),
        ];
        for err in server_errors {
            assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR, "{}", err);
        }
    }

    async fn render(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_error_envelope_hides_server_details() {
        let (status, body) = render(AppError::validation("titolo is required")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Validation error: titolo is required");

        let (status, body) = render(AppError::Persistence(sqlx::Error::Protocol(
            "disk I/O error at /var/lib/sync.db".to_string(),
        )))
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Database error");

        let (_, body) = render(AppError::Internal("Corrupt timestamp".to_string())).await;
        assert_eq!(body["error"], "An internal error occurred");
    }

    #[test]
    fn test_version_conflict_message() {
        let err = AppError::VersionConflict {
            entity_id: "task-1".to_string(),
            expected: 1,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Version conflict on task-1: expected 1, found 3"
        );
    }
}
