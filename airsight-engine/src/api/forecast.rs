//! Forecast and current-confidence endpoints
//!
//! A forecast without a model is a 200 with `status: "unavailable"`, never a
//! numeric body.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::parse_pollutant;
use crate::error::{ApiError, ApiResult};
use crate::forecast::ForecastOutcome;
use crate::pipeline::CurrentConfidence;
use crate::types::Location;
use crate::AppState;

/// Horizon used when the request names none
const DEFAULT_HORIZON_HOURS: u32 = 24;

#[derive(Debug, Deserialize)]
pub struct ForecastQuery {
    pub lat: f64,
    pub lon: f64,
    pub pollutant: String,
    pub horizon: Option<u32>,
    /// Overrides the configured forecast timeout
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ConfidenceQuery {
    pub lat: f64,
    pub lon: f64,
    pub pollutant: String,
}

/// GET /api/forecast
pub async fn get_forecast(
    State(state): State<AppState>,
    Query(query): Query<ForecastQuery>,
) -> ApiResult<Json<ForecastOutcome>> {
    let pollutant = parse_pollutant(&query.pollutant)?;
    let horizon = query.horizon.unwrap_or(DEFAULT_HORIZON_HOURS);
    debug!(lat = query.lat, lon = query.lon, pollutant = %pollutant, horizon, "Forecast request");

    let outcome = state
        .pipeline
        .get_forecast(
            Location::new(query.lat, query.lon),
            pollutant,
            horizon,
            query.timeout_ms.map(Duration::from_millis),
        )
        .await?;
    Ok(Json(outcome))
}

/// GET /api/confidence
pub async fn get_confidence(
    State(state): State<AppState>,
    Query(query): Query<ConfidenceQuery>,
) -> ApiResult<Json<CurrentConfidence>> {
    let pollutant = parse_pollutant(&query.pollutant)?;
    state
        .pipeline
        .get_current_confidence(Location::new(query.lat, query.lon), pollutant)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "No {} record near ({}, {})",
                pollutant, query.lat, query.lon
            ))
        })
}

/// Build forecast routes
pub fn forecast_routes() -> Router<AppState> {
    Router::new()
        .route("/api/forecast", get(get_forecast))
        .route("/api/confidence", get(get_confidence))
}
