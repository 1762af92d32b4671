use crate::services::upload_service::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

/// Maps the upload error taxonomy onto HTTP statuses. Storage failures are
/// logged here and reported without their internal detail.
impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::Validation(_) | UploadError::OutOfRange { .. } => StatusCode::BAD_REQUEST,
            UploadError::NotFound(_) | UploadError::ResumeTokenNotFound => StatusCode::NOT_FOUND,
            UploadError::IntegrityMismatch { .. }
            | UploadError::NotComplete { .. }
            | UploadError::AlreadyFinalized(_) => StatusCode::CONFLICT,
            UploadError::HandOff(_) => StatusCode::BAD_GATEWAY,
            UploadError::SizeMismatch { .. } | UploadError::ChunkMissing { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            UploadError::Sqlx(_) | UploadError::Io(_) | UploadError::Json(_) => {
                error!("storage failure: {}", err);
                return AppError::internal("internal storage error");
            }
        };
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn status_of(err: UploadError) -> StatusCode {
        AppError::from(err).status
    }

    #[test]
    fn maps_upload_errors_to_statuses() {
        assert_eq!(
            status_of(UploadError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(UploadError::OutOfRange {
                index: 4,
                total_chunks: 3
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(UploadError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(UploadError::ResumeTokenNotFound),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(UploadError::IntegrityMismatch {
                index: 0,
                expected: "abc".into(),
                actual: "def".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(UploadError::AlreadyFinalized("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(UploadError::SizeMismatch {
                upload_id: "x".into(),
                expected: 3,
                actual: 2
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn storage_errors_hide_details() {
        let err = AppError::from(UploadError::Io(io::Error::new(
            io::ErrorKind::Other,
            "/secret/path",
        )));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("secret"));
    }
}
