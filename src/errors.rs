use crate::{
    models::photo::PhotoValidationError,
    services::{
        job_queue::QueueError, storage_service::StorageError, upload_spool::SpoolError,
    },
};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};

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

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
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

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound(_)
            | StorageError::PhotoNotFound(_)
            | StorageError::InvalidFilename => AppError::not_found(err.to_string()),
            StorageError::Sqlx(_) | StorageError::Io(_) => {
                tracing::error!(error = %err, "storage failure");
                AppError::internal("storage failure, try again later")
            }
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        tracing::error!(error = %err, "queue failure");
        AppError::internal("queue failure, try again later")
    }
}

impl From<PhotoValidationError> for AppError {
    fn from(err: PhotoValidationError) -> Self {
        AppError::bad_request(err.to_string())
    }
}

impl From<SpoolError> for AppError {
    fn from(err: SpoolError) -> Self {
        match err {
            SpoolError::TooLarge { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            SpoolError::Io(io_err) => io_err.into(),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        tracing::error!(error = %err, "i/o failure");
        AppError::internal("i/o failure, try again later")
    }
}
