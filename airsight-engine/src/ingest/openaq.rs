//! OpenAQ ground-sensor client
//!
//! Queries the OpenAQ v2 `/measurements` endpoint around each configured
//! station for the last two hours.
//!
//! # API Reference
//! - Endpoint: https://api.openaq.org/v2/measurements
//! - Auth: `X-API-Key` header
//! - Rate Limit: 60 requests/minute

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{header, Client};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::IngestionAdapter;
use crate::config::{IngestionConfig, StationConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{Parameter, QualityFlag, RawReading, SourceInfo, SourceKind};

const ADAPTER_NAME: &str = "OpenAQ";

/// Rate limit: 1 request per second
const RATE_LIMIT_INTERVAL: Duration = Duration::from_millis(1000);

/// Search radius around a station, meters
const SEARCH_RADIUS_M: u32 = 25_000;

const PAGE_LIMIT: u32 = 500;

const USER_AGENT: &str = concat!("airsight-engine/", env!("CARGO_PKG_VERSION"));

/// OpenAQ client
pub struct OpenAqClient {
    http_client: Client,
    base_url: String,
    stations: Vec<StationConfig>,
    /// Rate limiter (last request time)
    rate_limiter: Arc<Mutex<Option<Instant>>>,
}

impl OpenAqClient {
    pub fn new(config: &IngestionConfig, api_key: &str) -> PipelineResult<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(USER_AGENT),
        );
        headers.insert(
            "X-API-Key",
            header::HeaderValue::from_str(api_key).map_err(|e| ingestion_error(e.to_string()))?,
        );

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| ingestion_error(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.openaq_base_url.trim_end_matches('/').to_string(),
            stations: config.stations.clone(),
            rate_limiter: Arc::new(Mutex::new(None)),
        })
    }

    async fn enforce_rate_limit(&self) {
        let mut last_request = self.rate_limiter.lock().await;

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < RATE_LIMIT_INTERVAL {
                let sleep_duration = RATE_LIMIT_INTERVAL - elapsed;
                debug!(
                    sleep_ms = sleep_duration.as_millis(),
                    "Rate limiting: sleeping before OpenAQ request"
                );
                sleep(sleep_duration).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    async fn fetch_station(
        &self,
        station: &StationConfig,
        since: DateTime<Utc>,
    ) -> PipelineResult<Vec<RawReading>> {
        self.enforce_rate_limit().await;

        let url = format!("{}/measurements", self.base_url);
        let coordinates = format!("{:.4},{:.4}", station.lat, station.lon);
        let date_from = since.to_rfc3339();
        let radius = SEARCH_RADIUS_M.to_string();
        let limit = PAGE_LIMIT.to_string();

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("coordinates", coordinates.as_str()),
                ("radius", radius.as_str()),
                ("date_from", date_from.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ingestion_error(format!("OpenAQ request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ingestion_error(format!(
                "OpenAQ returned error {}: {}",
                status, body
            )));
        }

        let page: MeasurementsResponse = response
            .json()
            .await
            .map_err(|e| ingestion_error(format!("Failed to parse OpenAQ response: {}", e)))?;

        Ok(readings_from_measurements(page, station))
    }
}

#[async_trait]
impl IngestionAdapter for OpenAqClient {
    fn name(&self) -> &str {
        ADAPTER_NAME
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Ground
    }

    async fn fetch(&self) -> PipelineResult<Vec<RawReading>> {
        let since = Utc::now() - ChronoDuration::hours(2);
        let mut readings = Vec::new();
        let mut last_error = None;

        for station in &self.stations {
            match self.fetch_station(station, since).await {
                Ok(mut batch) => {
                    debug!(station = %station.name, count = batch.len(), "OpenAQ station fetched");
                    readings.append(&mut batch);
                }
                Err(e) => {
                    warn!(station = %station.name, error = %e, "OpenAQ station fetch failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if readings.is_empty() => Err(e),
            _ => Ok(readings),
        }
    }
}

fn ingestion_error(message: String) -> PipelineError {
    PipelineError::Ingestion {
        adapter: ADAPTER_NAME.to_string(),
        message,
    }
}

#[derive(Debug, Deserialize)]
struct MeasurementsResponse {
    #[serde(default)]
    results: Vec<Measurement>,
}

#[derive(Debug, Deserialize)]
struct Measurement {
    parameter: String,
    value: Option<f64>,
    unit: String,
    date: MeasurementDate,
    coordinates: Option<Coordinates>,
}

#[derive(Debug, Deserialize)]
struct MeasurementDate {
    utc: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Coordinates {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Convert an OpenAQ page into raw readings
///
/// Parameters the pipeline does not track are dropped here. Units are passed
/// through untouched.
fn readings_from_measurements(
    page: MeasurementsResponse,
    station: &StationConfig,
) -> Vec<RawReading> {
    page.results
        .into_iter()
        .filter_map(|m| {
            let Some(parameter) = Parameter::parse(&m.parameter) else {
                debug!(parameter = %m.parameter, "Skipping untracked OpenAQ parameter");
                return None;
            };
            let value = m.value?;
            let (lat, lon) = m
                .coordinates
                .and_then(|c| Some((c.latitude?, c.longitude?)))
                .unwrap_or((station.lat, station.lon));

            // OpenAQ marks missing values with a negative sentinel
            let quality_flag = if value < 0.0 {
                QualityFlag::Invalid
            } else {
                QualityFlag::Unknown
            };

            Some(RawReading {
                source: SourceInfo::new(SourceKind::Ground, ADAPTER_NAME),
                parameter,
                value,
                unit: m.unit,
                lat,
                lon,
                timestamp: m.date.utc,
                quality_flag,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pollutant;

    const FIXTURE: &str = r#"{
        "meta": {"found": 4},
        "results": [
            {"locationId": 1, "location": "Downtown", "parameter": "pm25", "value": 12.4,
             "date": {"utc": "2024-03-10T14:00:00+00:00", "local": "2024-03-10T07:00:00-07:00"},
             "unit": "µg/m³", "coordinates": {"latitude": 34.0522, "longitude": -118.2437}},
            {"locationId": 1, "location": "Downtown", "parameter": "no2", "value": 0.021,
             "date": {"utc": "2024-03-10T14:00:00+00:00", "local": "2024-03-10T07:00:00-07:00"},
             "unit": "ppm", "coordinates": null},
            {"locationId": 1, "location": "Downtown", "parameter": "bc", "value": 1.1,
             "date": {"utc": "2024-03-10T14:00:00+00:00", "local": "2024-03-10T07:00:00-07:00"},
             "unit": "µg/m³", "coordinates": null},
            {"locationId": 2, "location": "Harbor", "parameter": "pm10", "value": -999.0,
             "date": {"utc": "2024-03-10T13:00:00+00:00", "local": "2024-03-10T06:00:00-07:00"},
             "unit": "µg/m³", "coordinates": {"latitude": 33.75, "longitude": -118.2}}
        ]
    }"#;

    #[test]
    fn test_measurements_parse_into_raw_readings() {
        let page: MeasurementsResponse = serde_json::from_str(FIXTURE).unwrap();
        let station = StationConfig::new("Los Angeles", 34.05, -118.25);
        let readings = readings_from_measurements(page, &station);

        assert_eq!(readings.len(), 3);

        assert_eq!(readings[0].parameter, Parameter::Pollutant(Pollutant::Pm25));
        assert_eq!(readings[0].unit, "µg/m³");
        assert!((readings[0].lat - 34.0522).abs() < 1e-9);

        // Units pass through; null coordinates fall back to the station
        assert_eq!(readings[1].unit, "ppm");
        assert_eq!((readings[1].lat, readings[1].lon), (34.05, -118.25));

        assert_eq!(readings[2].quality_flag, QualityFlag::Invalid);
        assert!(readings.iter().all(|r| !r.source.simulated));
    }

    #[test]
    fn test_empty_page_parses() {
        let page: MeasurementsResponse = serde_json::from_str(r#"{"meta": {}}"#).unwrap();
        let station = StationConfig::new("Chicago", 41.88, -87.63);
        assert!(readings_from_measurements(page, &station).is_empty());
    }
}
