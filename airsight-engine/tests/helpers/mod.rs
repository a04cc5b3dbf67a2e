//! Test helper utilities
//!
//! Shared fixtures for the airsight-engine integration tests: an in-memory
//! pipeline, a fixed-output ingestion adapter and reading/record builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Mutex;

use airsight_common::events::EventBus;
use airsight_engine::config::PipelineConfig;
use airsight_engine::db;
use airsight_engine::ingest::IngestionAdapter;
use airsight_engine::types::{
    CanonicalRecord, ConfidenceBand, LocationBinId, Parameter, Pollutant, QualityFlag, RawReading,
    SourceInfo, SourceKind, SpatialGrid, WeatherSnapshot, WeatherVariable,
};
use airsight_engine::{PipelineResult, Pipeline};

/// Test station away from grid-cell edges
pub const LAT: f64 = 34.12;
pub const LON: f64 = -118.31;

/// Start of every test series
pub fn hour(h: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap() + Duration::hours(h)
}

/// Adapter returning whatever readings the test queued
pub struct FixedAdapter {
    name: String,
    kind: SourceKind,
    readings: Mutex<Vec<RawReading>>,
}

impl FixedAdapter {
    pub fn new(name: &str, kind: SourceKind, readings: Vec<RawReading>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            readings: Mutex::new(readings),
        })
    }

    pub async fn set(&self, readings: Vec<RawReading>) {
        *self.readings.lock().await = readings;
    }
}

#[async_trait]
impl IngestionAdapter for FixedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self) -> PipelineResult<Vec<RawReading>> {
        Ok(self.readings.lock().await.clone())
    }
}

/// Configuration with a small, fast model
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.trainer.n_trees = 20;
    config.trainer.max_depth = 4;
    config
}

pub async fn memory_pool() -> SqlitePool {
    db::init_memory_pool().await.expect("in-memory pool")
}

pub fn pipeline_with(
    pool: SqlitePool,
    config: PipelineConfig,
    adapters: Vec<Arc<dyn IngestionAdapter>>,
) -> Arc<Pipeline> {
    Arc::new(Pipeline::with_adapters(
        pool,
        config,
        EventBus::new(100),
        adapters,
    ))
}

pub fn reading(
    kind: SourceKind,
    provider: &str,
    parameter: Parameter,
    value: f64,
    unit: &str,
    at: DateTime<Utc>,
) -> RawReading {
    RawReading {
        source: SourceInfo::new(kind, provider),
        parameter,
        value,
        unit: unit.to_string(),
        lat: LAT,
        lon: LON,
        timestamp: at,
        quality_flag: QualityFlag::Good,
    }
}

pub fn ground(pollutant: Pollutant, value: f64, at: DateTime<Utc>) -> RawReading {
    reading(
        SourceKind::Ground,
        "OpenAQ",
        Parameter::Pollutant(pollutant),
        value,
        "µg/m³",
        at,
    )
}

pub fn satellite(pollutant: Pollutant, value: f64, at: DateTime<Utc>) -> RawReading {
    reading(
        SourceKind::Satellite,
        "TEMPO",
        Parameter::Pollutant(pollutant),
        value,
        "ug/m3",
        at,
    )
}

pub fn temperature(celsius: f64, at: DateTime<Utc>) -> RawReading {
    reading(
        SourceKind::Weather,
        "OpenWeather",
        Parameter::Weather(WeatherVariable::Temperature),
        celsius,
        "°C",
        at,
    )
}

/// Smooth daily cycle with a weekly wobble
pub fn daily_cycle(h: i64) -> f64 {
    20.0 + 8.0 * ((h as f64) / 24.0 * std::f64::consts::TAU).sin() + (h % 7) as f64 * 0.5
}

/// Hourly ground PM2.5 readings at the test station
pub fn ground_series(hours: i64) -> Vec<RawReading> {
    (0..hours)
        .map(|h| ground(Pollutant::Pm25, daily_cycle(h), hour(h)))
        .collect()
}

/// Default-grid bin containing (lat, lon)
pub fn bin_at(lat: f64, lon: f64) -> LocationBinId {
    SpatialGrid::new(PipelineConfig::default().harmonizer.bin_size_deg).bin_for(lat, lon)
}

/// Canonical PM2.5 records for `hours` consecutive hours at one location
pub fn canonical_series(lat: f64, lon: f64, hours: std::ops::Range<i64>) -> Vec<CanonicalRecord> {
    let grid = SpatialGrid::new(PipelineConfig::default().harmonizer.bin_size_deg);
    let bin = bin_at(lat, lon);
    let centroid = grid.centroid(bin);
    hours
        .map(|h| CanonicalRecord {
            location_bin_id: bin,
            hour_bucket: hour(h),
            pollutant: Pollutant::Pm25,
            lat: centroid.lat,
            lon: centroid.lon,
            value: daily_cycle(h),
            contributing_sources: vec!["ground:OpenAQ".to_string()],
            confidence: 0.71,
            band: ConfidenceBand::Medium,
            reason: None,
            discrepancy: None,
            anomaly: false,
            weather: WeatherSnapshot::default(),
        })
        .collect()
}

/// Ingest, harmonize and validate whatever the adapters return
pub async fn run_through_validation(pipeline: &Pipeline) {
    let ingest = pipeline.run_ingestion().await;
    assert!(ingest.ok, "ingestion failed: {:?}", ingest.detail);
    let harmonize = pipeline.run_harmonization().await;
    assert!(harmonize.ok, "harmonization failed: {:?}", harmonize.detail);
    let validate = pipeline.run_validation_and_persist().await;
    assert!(validate.ok, "validation failed: {:?}", validate.detail);
}
