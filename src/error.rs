use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced to the page, one variant per kind the user can act on.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Number of videos must be between 2 and 5, got {0:?}")]
    InvalidCount(String),

    #[error("Number of videos was not provided")]
    MissingCount,

    #[error("Upload slot {slot} does not exist, only {count} slots are open")]
    InvalidSlot { slot: usize, count: usize },

    #[error("Please upload all {expected} videos to enable merging ({received} received)")]
    Incomplete { expected: usize, received: usize },

    #[error("Unsupported video format: {name}")]
    UnsupportedFormat { name: String },

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Media failure: {0}")]
    Media(String),

    #[error("Merge was cancelled")]
    Cancelled,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidCount,
    InvalidSlot,
    Incomplete,
    UnsupportedFormat,
    Io,
    Media,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidCount => "invalid_count",
            ErrorKind::InvalidSlot => "invalid_slot",
            ErrorKind::Incomplete => "incomplete",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::Io => "io",
            ErrorKind::Media => "media",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl MergeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MergeError::InvalidCount(_) | MergeError::MissingCount => ErrorKind::InvalidCount,
            MergeError::InvalidSlot { .. } => ErrorKind::InvalidSlot,
            MergeError::Incomplete { .. } => ErrorKind::Incomplete,
            MergeError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            MergeError::Io(_) => ErrorKind::Io,
            MergeError::Media(_) => ErrorKind::Media,
            MergeError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Convert error to the HTTP status code returned by the API
    pub fn to_err_code(&self) -> StatusCode {
        match self {
            MergeError::InvalidCount(_)
            | MergeError::MissingCount
            | MergeError::InvalidSlot { .. } => StatusCode::BAD_REQUEST,
            MergeError::Incomplete { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            MergeError::UnsupportedFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            MergeError::Io(_) | MergeError::Media(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MergeError::Cancelled => StatusCode::CONFLICT,
        }
    }

    /// Folds an error from the FFmpeg plumbing into a `MergeError`, keeping
    /// cancellation and I/O distinct from media failures.
    pub fn from_pipeline(error: anyhow::Error) -> Self {
        match error.downcast::<MergeError>() {
            Ok(error) => error,
            Err(error) => match error.downcast::<std::io::Error>() {
                Ok(error) => MergeError::Io(error),
                Err(error) => MergeError::Media(format!("{error:#}")),
            },
        }
    }
}

/// JSON body of every API error.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub kind: &'static str,
    pub message: String,
}

impl IntoResponse for MergeError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            kind: self.kind().as_str(),
            message: self.to_string(),
        };
        (self.to_err_code(), Json(body)).into_response()
    }
}
