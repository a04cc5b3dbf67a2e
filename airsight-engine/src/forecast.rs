//! Recursive multi-step forecasting
//!
//! Each step builds a feature row for the next hour from the series so far,
//! predicts it, and appends the prediction as pseudo-history for the steps
//! after it. Confidence decays linearly with the step and never rises.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::ForecasterConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::features::{build_row, feature_columns, HourlySeries};
use crate::harmonize::aqi::{self, Aqi};
use crate::registry::ActiveModel;
use crate::types::{Pollutant, WeatherSnapshot, WeatherVariable};

/// One forecast hour
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub horizon_hour: u32,
    pub predicted_value: f64,
    pub confidence: f64,
    pub aqi: Option<Aqi>,
}

/// Forecast result; `Unavailable` is never a numeric forecast
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForecastOutcome {
    #[serde(rename = "ok")]
    Available {
        pollutant: Pollutant,
        location_bin_id: String,
        model_version: i64,
        origin: DateTime<Utc>,
        points: Vec<ForecastPoint>,
    },
    Unavailable {
        pollutant: Pollutant,
        reason: String,
    },
}

impl ForecastOutcome {
    pub fn points(&self) -> Option<&[ForecastPoint]> {
        match self {
            ForecastOutcome::Available { points, .. } => Some(points),
            ForecastOutcome::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, ForecastOutcome::Available { .. })
    }
}

/// Stateless forecaster; the model and history are supplied per call
#[derive(Debug, Clone)]
pub struct Forecaster {
    config: ForecasterConfig,
}

impl Forecaster {
    pub fn new(config: &ForecasterConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// `max(floor, base − decay × h)`
    pub fn confidence_at(&self, horizon_hour: u32) -> f64 {
        (self.config.base_confidence - self.config.decay_rate * horizon_hour as f64)
            .max(self.config.confidence_floor)
    }

    pub fn validate_horizon(&self, horizon_hours: u32) -> PipelineResult<()> {
        let (min, max) = (self.config.min_horizon_hours, self.config.max_horizon_hours);
        if (min..=max).contains(&horizon_hours) {
            Ok(())
        } else {
            Err(PipelineError::InvalidRequest(format!(
                "horizon must be between {} and {} hours, got {}",
                min, max, horizon_hours
            )))
        }
    }

    /// Forecast `horizon_hours` steps after `origin`
    ///
    /// Points of `history` after `origin` are discarded before the first
    /// step.
    pub fn forecast(
        &self,
        model: &ActiveModel,
        mut history: HourlySeries,
        origin: DateTime<Utc>,
        horizon_hours: u32,
    ) -> PipelineResult<Vec<ForecastPoint>> {
        self.validate_horizon(horizon_hours)?;
        if model.feature_columns != feature_columns() {
            return Err(PipelineError::ForecastUnavailable {
                pollutant: model.pollutant,
                reason: format!(
                    "model v{} was trained with a different feature layout",
                    model.version
                ),
            });
        }

        history.truncate_after(origin);
        let weather = carried_weather(&history);
        let mut points = Vec::with_capacity(horizon_hours as usize);

        for step in 1..=horizon_hours {
            let timestamp = origin + Duration::hours(step as i64);
            let row = build_row(&history, timestamp, &weather);
            let raw = model.model.predict(&row);
            if !raw.is_finite() {
                return Err(PipelineError::ForecastUnavailable {
                    pollutant: model.pollutant,
                    reason: format!("non-finite prediction at +{}h", step),
                });
            }
            let predicted_value = raw.max(0.0);
            history.insert(timestamp, predicted_value, weather.clone());

            points.push(ForecastPoint {
                timestamp,
                horizon_hour: step,
                predicted_value,
                confidence: self.confidence_at(step),
                aqi: aqi::compute(model.pollutant, predicted_value),
            });
        }

        Ok(points)
    }
}

/// Latest known value of each weather variable in the series
fn carried_weather(series: &HourlySeries) -> WeatherSnapshot {
    let mut carried = WeatherSnapshot::default();
    for (_, point) in series.iter() {
        for variable in [
            WeatherVariable::Temperature,
            WeatherVariable::Humidity,
            WeatherVariable::WindSpeed,
            WeatherVariable::WindDirection,
            WeatherVariable::Pressure,
        ] {
            if let Some(value) = point.weather.get(variable) {
                carried.set(variable, value);
            }
        }
        if point.weather.observed_at.is_some() {
            carried.observed_at = point.weather.observed_at;
        }
    }
    carried
}
