use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by the capture, scan and upload pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("camera access requires a secure context (https or localhost)")]
    UnsupportedContext,
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("timed out waiting for the camera")]
    Timeout,
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("frame capture failed: {0}")]
    CaptureFailed(String),
    #[error("code decoder failed to start: {0}")]
    DecoderInitFailed(String),
    #[error("a submission is already in progress")]
    SubmissionInProgress,
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{message}")]
    Rejected { status: u16, message: String },
    #[error("operation cancelled by teardown")]
    Cancelled,
}

/// Manual path the screen should offer when the live device path fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    FileUpload,
    ManualCode,
}

impl PipelineError {
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedContext
                | Self::PermissionDenied(_)
                | Self::Timeout
                | Self::DeviceUnavailable(_)
                | Self::DecoderInitFailed(_)
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedContext | Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::DeviceUnavailable(_) | Self::SubmissionInProgress => StatusCode::CONFLICT,
            Self::CaptureFailed(_) | Self::DecoderInitFailed(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::NetworkFailure(_) | Self::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            Self::Rejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    fallback: Option<Fallback>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fallback: Option<Fallback>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            fallback: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Wraps a pipeline failure; device errors point the screen at `fallback`.
    pub fn pipeline(err: PipelineError, fallback: Fallback) -> Self {
        let fallback = err.is_device_error().then_some(fallback);
        Self {
            status: err.status(),
            message: err.to_string(),
            fallback,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(format!("{value:#}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            message: &self.message,
            fallback: self.fallback,
        };
        (self.status, Json(body)).into_response()
    }
}
