//! Error responses for the HTTP API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::provider::ProbeError;
use crate::scheduler::{ConfigError, SchedulerError};
use crate::storage::StorageError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message },
            "meta": { "timestamp": chrono::Utc::now().to_rfc3339() }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::CycleInProgress => ApiError::conflict(err.to_string()),
            SchedulerError::CycleCrashed(_) => {
                tracing::error!(error = %err, "cycle crashed");
                ApiError::internal(err.to_string())
            }
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidInterval
            | ConfigError::IntervalTooLarge(_)
            | ConfigError::DelayTooLarge(_)
            | ConfigError::UnknownProvider(_) => {
                ApiError::bad_request(err.to_string())
            }
            ConfigError::Storage(e) => e.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UnsupportedFormat(_) => ApiError::bad_request(err.to_string()),
            _ => {
                tracing::error!(error = %err, "storage error");
                ApiError::internal("storage error occurred")
            }
        }
    }
}

impl From<ProbeError> for ApiError {
    fn from(err: ProbeError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
