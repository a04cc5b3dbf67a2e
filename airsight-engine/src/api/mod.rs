//! HTTP API handlers
//!
//! Read operations under `/api`, scheduler triggers under `/jobs`, and
//! `/health`.

pub mod forecast;
pub mod health;
pub mod jobs;

pub use forecast::forecast_routes;
pub use health::health_routes;
pub use jobs::job_routes;

use crate::error::ApiError;
use crate::types::Pollutant;

/// Parse a pollutant query parameter
pub(crate) fn parse_pollutant(name: &str) -> Result<Pollutant, ApiError> {
    Pollutant::parse(name).ok_or_else(|| ApiError::BadRequest(format!("Unknown pollutant: {}", name)))
}
