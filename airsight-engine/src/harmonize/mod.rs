// Harmonizer - unit normalization, spatial/temporal bucketing, source merge
//
// Raw readings → canonical units → (bin, hour, pollutant) cells → one
// HarmonizedCandidate per cell with every source's contribution and the
// nearest weather context attached.

pub mod aqi;
pub mod units;

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::HarmonizerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{
    HarmonizedCandidate, Location, Parameter, QualityFlag, RawReading, RecordKey, SourceInfo,
    SourceKind, SourceValue, SpatialGrid, WeatherSnapshot, WeatherVariable,
};
use airsight_common::time::hour_bucket;

/// A reading that passed validation, in canonical units
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReading {
    pub source: SourceInfo,
    pub parameter: Parameter,
    pub value: f64,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
    pub quality: QualityFlag,
}

/// A reading isolated from its batch
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedReading {
    /// Position in the input batch
    pub index: usize,
    pub reason: String,
}

/// Result of harmonizing one batch
#[derive(Debug, Clone, Default)]
pub struct HarmonizeOutput {
    /// Sorted by (bin, hour, pollutant)
    pub candidates: Vec<HarmonizedCandidate>,
    pub rejected: Vec<RejectedReading>,
}

/// Cells merge by (kind, provider); the simulated flag is not part of the key
type SourceKey = (SourceKind, String);

#[derive(Default)]
struct SourceAccumulator {
    values: Vec<f64>,
    quality: Option<QualityFlag>,
    simulated: bool,
}

impl SourceAccumulator {
    fn push(&mut self, reading: &NormalizedReading) {
        self.values.push(reading.value);
        // QualityFlag orders good < unknown < suspect < invalid
        self.quality = Some(
            self.quality
                .map_or(reading.quality, |q| q.max(reading.quality)),
        );
        self.simulated |= reading.source.simulated;
    }
}

/// Order-independent mean
fn stable_mean(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    values.iter().sum::<f64>() / values.len() as f64
}

/// Pure, deterministic harmonizer
#[derive(Debug, Clone)]
pub struct Harmonizer {
    grid: SpatialGrid,
    weather_radius_deg: f64,
    weather_max_gap: Duration,
}

impl Harmonizer {
    pub fn new(config: &HarmonizerConfig) -> Self {
        Self {
            grid: SpatialGrid::new(config.bin_size_deg),
            weather_radius_deg: config.weather_radius_deg,
            weather_max_gap: Duration::hours(config.weather_max_gap_hours),
        }
    }

    pub fn grid(&self) -> SpatialGrid {
        self.grid
    }

    /// How far outside a batch's hours weather readings can still be merged
    pub fn weather_max_gap(&self) -> Duration {
        self.weather_max_gap
    }

    /// Validate a reading and convert it to canonical units
    pub fn normalize(&self, reading: &RawReading) -> PipelineResult<NormalizedReading> {
        if !reading.value.is_finite() {
            return Err(PipelineError::Data(format!(
                "Non-finite {} value from {}",
                reading.parameter,
                reading.source.label()
            )));
        }
        if !Location::new(reading.lat, reading.lon).is_valid() {
            return Err(PipelineError::Data(format!(
                "Coordinates out of range: ({}, {})",
                reading.lat, reading.lon
            )));
        }
        if reading.quality_flag == QualityFlag::Invalid {
            return Err(PipelineError::Data(format!(
                "Reading flagged invalid by {}",
                reading.source.label()
            )));
        }

        let value = units::to_canonical(reading.parameter, reading.value, &reading.unit)?;
        check_physical_range(reading.parameter, value)?;

        Ok(NormalizedReading {
            source: reading.source.clone(),
            parameter: reading.parameter,
            value,
            lat: reading.lat,
            lon: reading.lon,
            timestamp: reading.timestamp,
            quality: reading.quality_flag,
        })
    }

    /// Harmonize a batch
    ///
    /// Invalid readings are isolated into `rejected`; the rest of the batch
    /// proceeds. Running the same batch twice yields identical output.
    pub fn harmonize(&self, readings: &[RawReading]) -> HarmonizeOutput {
        let mut rejected = Vec::new();
        let mut cells: BTreeMap<RecordKey, BTreeMap<SourceKey, SourceAccumulator>> =
            BTreeMap::new();
        let mut weather: BTreeMap<DateTime<Utc>, Vec<NormalizedReading>> = BTreeMap::new();

        for (index, reading) in readings.iter().enumerate() {
            let normalized = match self.normalize(reading) {
                Ok(n) => n,
                Err(e) => {
                    debug!(index, error = %e, "Rejected raw reading");
                    rejected.push(RejectedReading {
                        index,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match normalized.parameter {
                Parameter::Pollutant(pollutant) => {
                    let key = RecordKey {
                        location_bin_id: self.grid.bin_for(normalized.lat, normalized.lon),
                        hour_bucket: hour_bucket(normalized.timestamp),
                        pollutant,
                    };
                    cells
                        .entry(key)
                        .or_default()
                        .entry((normalized.source.kind, normalized.source.provider.clone()))
                        .or_default()
                        .push(&normalized);
                }
                Parameter::Weather(_) => {
                    weather
                        .entry(hour_bucket(normalized.timestamp))
                        .or_default()
                        .push(normalized);
                }
            }
        }

        let candidates = cells
            .into_iter()
            .map(|(key, sources)| self.merge_cell(key, sources, &weather))
            .collect();

        HarmonizeOutput {
            candidates,
            rejected,
        }
    }

    fn merge_cell(
        &self,
        key: RecordKey,
        sources: BTreeMap<SourceKey, SourceAccumulator>,
        weather: &BTreeMap<DateTime<Utc>, Vec<NormalizedReading>>,
    ) -> HarmonizedCandidate {
        let mut primary = Vec::new();
        let mut fallback = Vec::new();
        let mut source_values = Vec::with_capacity(sources.len());

        // BTreeMap order puts ground sources first, then by provider
        for ((kind, provider), mut acc) in sources {
            if kind == SourceKind::Ground {
                primary.extend_from_slice(&acc.values);
            } else {
                fallback.extend_from_slice(&acc.values);
            }
            source_values.push(SourceValue {
                value: stable_mean(&mut acc.values),
                reading_count: acc.values.len(),
                quality: acc.quality.unwrap_or(QualityFlag::Unknown),
                source: SourceInfo {
                    kind,
                    provider,
                    simulated: acc.simulated,
                },
            });
        }

        let value = if primary.is_empty() {
            stable_mean(&mut fallback)
        } else {
            stable_mean(&mut primary)
        };

        let centroid = self.grid.centroid(key.location_bin_id);
        HarmonizedCandidate {
            key,
            lat: centroid.lat,
            lon: centroid.lon,
            value,
            sources: source_values,
            weather: self.nearest_weather(centroid, key.hour_bucket, weather),
        }
    }

    /// Per variable, the reading closest in time (then distance) within limits
    fn nearest_weather(
        &self,
        centroid: Location,
        hour: DateTime<Utc>,
        weather: &BTreeMap<DateTime<Utc>, Vec<NormalizedReading>>,
    ) -> WeatherSnapshot {
        let mut best: BTreeMap<WeatherVariable, (i64, f64, &NormalizedReading)> = BTreeMap::new();
        let window = (hour - self.weather_max_gap)..=(hour + self.weather_max_gap);

        for reading in weather.range(window).flat_map(|(_, v)| v.iter()) {
            let Parameter::Weather(variable) = reading.parameter else {
                continue;
            };
            let dt = (reading.timestamp - hour).num_seconds().abs();
            if dt > self.weather_max_gap.num_seconds() {
                continue;
            }
            let dist = ((reading.lat - centroid.lat).powi(2) + (reading.lon - centroid.lon).powi(2))
                .sqrt();
            if dist > self.weather_radius_deg {
                continue;
            }

            let closer = match best.get(&variable) {
                None => true,
                Some(&(best_dt, best_dist, best_reading)) => dt
                    .cmp(&best_dt)
                    .then(dist.total_cmp(&best_dist))
                    .then(reading.value.total_cmp(&best_reading.value))
                    == Ordering::Less,
            };
            if closer {
                best.insert(variable, (dt, dist, reading));
            }
        }

        let mut snapshot = WeatherSnapshot::default();
        let mut observed: Option<(i64, DateTime<Utc>)> = None;
        for (variable, (dt, _, reading)) in best {
            snapshot.set(variable, reading.value);
            if observed.map_or(true, |(best_dt, ts)| (dt, reading.timestamp) < (best_dt, ts)) {
                observed = Some((dt, reading.timestamp));
            }
        }
        snapshot.observed_at = observed.map(|(_, ts)| ts);
        snapshot
    }
}

fn check_physical_range(parameter: Parameter, value: f64) -> PipelineResult<()> {
    let ok = match parameter {
        Parameter::Pollutant(_) => value >= 0.0,
        Parameter::Weather(WeatherVariable::Humidity) => (0.0..=100.0).contains(&value),
        Parameter::Weather(WeatherVariable::WindSpeed) => value >= 0.0,
        Parameter::Weather(WeatherVariable::Pressure) => value > 0.0,
        Parameter::Weather(WeatherVariable::Temperature) => value >= -273.15,
        Parameter::Weather(WeatherVariable::WindDirection) => (0.0..=360.0).contains(&value),
    };
    if ok && value.is_finite() {
        Ok(())
    } else {
        Err(PipelineError::Data(format!(
            "{} value {} outside physical range",
            parameter, value
        )))
    }
}
