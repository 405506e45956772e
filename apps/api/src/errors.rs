use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::versioning::error::VersionError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Version(#[from] VersionError),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Version(err) => classify_version_error(err),
        }
    }
}

/// Maps the version engine taxonomy onto HTTP.
///
/// - Not-found cases map to 404.
/// - Lost races map to 409 with a "reload and try again" message.
/// - Integrity faults and database failures map to 500 and are logged.
fn classify_version_error(err: &VersionError) -> (StatusCode, &'static str, String) {
    match err {
        VersionError::DocumentNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        VersionError::VersionNotFound { .. } => {
            (StatusCode::NOT_FOUND, "VERSION_NOT_FOUND", err.to_string())
        }
        VersionError::ConcurrentEditConflict { .. } | VersionError::VersionConflict { .. } => (
            StatusCode::CONFLICT,
            "CONFLICT",
            "Someone else changed this prompt. Reload and try again.".to_string(),
        ),
        VersionError::CorruptHistory { .. } => {
            tracing::error!("Corrupt history: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CORRUPT_HISTORY",
                "The version history of this prompt is inconsistent".to_string(),
            )
        }
        VersionError::PatchMismatch { .. } => {
            tracing::error!("Patch mismatch: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PATCH_MISMATCH",
                "A stored diff does not match its snapshot".to_string(),
            )
        }
        VersionError::Store(e) => {
            tracing::error!("Database error: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            )
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
