//! airsight-engine library interface
//!
//! Ingestion, harmonization, validation, model training and forecasting for
//! air-quality measurements. The binary wraps this library in an HTTP server;
//! integration tests drive it directly.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod forecast;
pub mod harmonize;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod trainer;
pub mod types;
pub mod utils;
pub mod validate;

pub use crate::error::{ApiError, ApiResult, PipelineError, PipelineResult};
pub use crate::pipeline::{JobStatus, Pipeline};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::forecast_routes())
        .merge(api::job_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
