//! Error types for airsight-engine
//!
//! `PipelineError` is the domain taxonomy. Scheduler entry points never let
//! it escape; they fold it into a `JobStatus`. `ApiError` maps failures to
//! JSON HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::Pollutant;

/// Pipeline error taxonomy
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed reading or unrecognized unit; isolate the record, continue the batch
    #[error("Data error: {0}")]
    Data(String),

    /// Below the training floor; training is skipped and the prior model kept
    #[error("Insufficient data for {pollutant}: {available} usable rows, {required} required")]
    InsufficientData {
        pollutant: Pollutant,
        available: usize,
        required: usize,
    },

    /// Model could not be fitted or evaluated (non-finite values, degenerate data)
    #[error("Training failed for {pollutant}: {message}")]
    Training { pollutant: Pollutant, message: String },

    /// Write or swap of a model failed; the old model stays active
    #[error("Model persistence failed for {pollutant}: {message}")]
    ModelPersistence { pollutant: Pollutant, message: String },

    /// No active model for the pollutant
    #[error("Forecast unavailable for {pollutant}: {reason}")]
    ForecastUnavailable { pollutant: Pollutant, reason: String },

    /// Caller-supplied request parameters are out of range
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Forecast did not finish within the caller's timeout
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Upstream source failed (network, parse)
    #[error("Ingestion error from {adapter}: {message}")]
    Ingestion { adapter: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database or configuration failure from the shared layer
    #[error(transparent)]
    Common(#[from] airsight_common::Error),
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Common(airsight_common::Error::Database(err))
    }
}

/// Result alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Request exceeded its deadline (504)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            PipelineError::Timeout(ms) => {
                ApiError::Timeout(format!("Forecast timed out after {} ms", ms))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg,
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
