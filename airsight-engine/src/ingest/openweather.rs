//! OpenWeather current-conditions client
//!
//! One `/weather` call per station with `units=metric`; each response
//! becomes five weather readings.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
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
use crate::types::{Parameter, QualityFlag, RawReading, SourceInfo, SourceKind, WeatherVariable};

const ADAPTER_NAME: &str = "OpenWeather";

/// Rate limit: 1 request per second (free tier is 60/minute)
const RATE_LIMIT_INTERVAL: Duration = Duration::from_millis(1000);

const USER_AGENT: &str = concat!("airsight-engine/", env!("CARGO_PKG_VERSION"));

/// OpenWeather client
pub struct OpenWeatherClient {
    http_client: Client,
    base_url: String,
    api_key: String,
    stations: Vec<StationConfig>,
    rate_limiter: Arc<Mutex<Option<Instant>>>,
}

impl OpenWeatherClient {
    pub fn new(config: &IngestionConfig, api_key: &str) -> PipelineResult<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(USER_AGENT),
        );

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| ingestion_error(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.openweather_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            stations: config.stations.clone(),
            rate_limiter: Arc::new(Mutex::new(None)),
        })
    }

    async fn enforce_rate_limit(&self) {
        let mut last_request = self.rate_limiter.lock().await;

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < RATE_LIMIT_INTERVAL {
                sleep(RATE_LIMIT_INTERVAL - elapsed).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    async fn fetch_station(&self, station: &StationConfig) -> PipelineResult<Vec<RawReading>> {
        self.enforce_rate_limit().await;

        let url = format!("{}/weather", self.base_url);
        let lat = station.lat.to_string();
        let lon = station.lon.to_string();

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("lat", lat.as_str()),
                ("lon", lon.as_str()),
                ("units", "metric"),
                ("appid", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ingestion_error(format!("OpenWeather request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ingestion_error(format!(
                "OpenWeather returned error {}: {}",
                status, body
            )));
        }

        let current: CurrentWeather = response
            .json()
            .await
            .map_err(|e| ingestion_error(format!("Failed to parse OpenWeather response: {}", e)))?;

        readings_from_current(current, station)
    }
}

#[async_trait]
impl IngestionAdapter for OpenWeatherClient {
    fn name(&self) -> &str {
        ADAPTER_NAME
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Weather
    }

    async fn fetch(&self) -> PipelineResult<Vec<RawReading>> {
        let mut readings = Vec::new();
        let mut last_error = None;

        for station in &self.stations {
            match self.fetch_station(station).await {
                Ok(mut batch) => readings.append(&mut batch),
                Err(e) => {
                    warn!(station = %station.name, error = %e, "OpenWeather station fetch failed");
                    last_error = Some(e);
                }
            }
        }

        debug!(count = readings.len(), "OpenWeather fetch complete");
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
struct CurrentWeather {
    coord: Option<Coord>,
    main: MainBlock,
    wind: Option<Wind>,
    /// Observation time, unix seconds
    dt: i64,
}

#[derive(Debug, Deserialize)]
struct Coord {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: Option<f64>,
    pressure: Option<f64>,
    humidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Wind {
    speed: Option<f64>,
    deg: Option<f64>,
}

fn readings_from_current(
    current: CurrentWeather,
    station: &StationConfig,
) -> PipelineResult<Vec<RawReading>> {
    let timestamp: DateTime<Utc> = Utc
        .timestamp_opt(current.dt, 0)
        .single()
        .ok_or_else(|| ingestion_error(format!("Invalid observation time: {}", current.dt)))?;
    let (lat, lon) = current
        .coord
        .map(|c| (c.lat, c.lon))
        .unwrap_or((station.lat, station.lon));
    let wind = current.wind.unwrap_or(Wind {
        speed: None,
        deg: None,
    });

    let values = [
        (WeatherVariable::Temperature, current.main.temp, "°C"),
        (WeatherVariable::Humidity, current.main.humidity, "%"),
        (WeatherVariable::Pressure, current.main.pressure, "hPa"),
        (WeatherVariable::WindSpeed, wind.speed, "m/s"),
        (WeatherVariable::WindDirection, wind.deg, "deg"),
    ];

    Ok(values
        .into_iter()
        .filter_map(|(variable, value, unit)| {
            Some(RawReading {
                source: SourceInfo::new(SourceKind::Weather, ADAPTER_NAME),
                parameter: Parameter::Weather(variable),
                value: value?,
                unit: unit.to_string(),
                lat,
                lon,
                timestamp,
                quality_flag: QualityFlag::Good,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_weather_parses_into_five_readings() {
        let body = r#"{
            "coord": {"lon": -118.2437, "lat": 34.0522},
            "weather": [{"id": 800, "main": "Clear"}],
            "main": {"temp": 21.3, "feels_like": 20.9, "pressure": 1015, "humidity": 48},
            "wind": {"speed": 3.6, "deg": 250},
            "dt": 1710079200,
            "name": "Los Angeles"
        }"#;
        let current: CurrentWeather = serde_json::from_str(body).unwrap();
        let station = StationConfig::new("Los Angeles", 34.05, -118.25);
        let readings = readings_from_current(current, &station).unwrap();

        assert_eq!(readings.len(), 5);
        assert_eq!(readings[0].timestamp, Utc.timestamp_opt(1_710_079_200, 0).unwrap());
        let pressure = readings
            .iter()
            .find(|r| r.parameter == Parameter::Weather(WeatherVariable::Pressure))
            .unwrap();
        assert_eq!(pressure.value, 1015.0);
        assert_eq!(pressure.unit, "hPa");
    }

    #[test]
    fn test_missing_wind_block_yields_fewer_readings() {
        let body = r#"{"main": {"temp": 5.0, "humidity": 80}, "dt": 1710079200}"#;
        let current: CurrentWeather = serde_json::from_str(body).unwrap();
        let station = StationConfig::new("Chicago", 41.88, -87.63);
        let readings = readings_from_current(current, &station).unwrap();

        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| (r.lat, r.lon) == (41.88, -87.63)));
    }
}
