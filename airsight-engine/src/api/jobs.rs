//! Scheduler trigger endpoints
//!
//! Each POST runs one job to completion and returns its `JobStatus`. A job
//! that failed internally is still a 200; check `ok` in the body.

use axum::{
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use super::parse_pollutant;
use crate::error::ApiResult;
use crate::pipeline::JobStatus;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RetrainQuery {
    /// Retrain only this pollutant; all defaults when absent
    pub pollutant: Option<String>,
}

/// POST /jobs/ingest
pub async fn run_ingestion(State(state): State<AppState>) -> Json<JobStatus> {
    Json(state.pipeline.run_ingestion().await)
}

/// POST /jobs/harmonize
pub async fn run_harmonization(State(state): State<AppState>) -> Json<JobStatus> {
    Json(state.pipeline.run_harmonization().await)
}

/// POST /jobs/validate
pub async fn run_validation(State(state): State<AppState>) -> Json<JobStatus> {
    Json(state.pipeline.run_validation_and_persist().await)
}

/// POST /jobs/retrain
pub async fn run_retrain(
    State(state): State<AppState>,
    Query(query): Query<RetrainQuery>,
) -> ApiResult<Json<JobStatus>> {
    let pollutant = query.pollutant.as_deref().map(parse_pollutant).transpose()?;
    Ok(Json(state.pipeline.run_retrain(pollutant).await))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/ingest", post(run_ingestion))
        .route("/jobs/harmonize", post(run_harmonization))
        .route("/jobs/validate", post(run_validation))
        .route("/jobs/retrain", post(run_retrain))
}
