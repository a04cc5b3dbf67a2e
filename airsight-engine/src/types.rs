//! Core domain types for the harmonization and forecasting pipeline
//!
//! Raw readings flow in from ingestion adapters, are merged into
//! `HarmonizedCandidate`s per (bin, hour, pollutant), and leave the validator
//! as confidence-tagged `CanonicalRecord`s.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Measured parameters
// ============================================================================

/// Pollutants tracked by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pollutant {
    #[serde(rename = "NO2")]
    No2,
    #[serde(rename = "O3")]
    O3,
    #[serde(rename = "PM2.5")]
    Pm25,
    #[serde(rename = "PM10")]
    Pm10,
    #[serde(rename = "CO")]
    Co,
    #[serde(rename = "SO2")]
    So2,
    #[serde(rename = "HCHO")]
    Hcho,
}

impl Pollutant {
    pub const ALL: [Pollutant; 7] = [
        Pollutant::No2,
        Pollutant::O3,
        Pollutant::Pm25,
        Pollutant::Pm10,
        Pollutant::Co,
        Pollutant::So2,
        Pollutant::Hcho,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pollutant::No2 => "NO2",
            Pollutant::O3 => "O3",
            Pollutant::Pm25 => "PM2.5",
            Pollutant::Pm10 => "PM10",
            Pollutant::Co => "CO",
            Pollutant::So2 => "SO2",
            Pollutant::Hcho => "HCHO",
        }
    }

    /// Parse a pollutant name, accepting the spellings upstream providers use
    /// (`pm25`, `pm2.5`, `no2`, `o3`, ...)
    pub fn parse(name: &str) -> Option<Self> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "no2" => Some(Pollutant::No2),
            "o3" | "ozone" => Some(Pollutant::O3),
            "pm25" | "pm2.5" => Some(Pollutant::Pm25),
            "pm10" => Some(Pollutant::Pm10),
            "co" => Some(Pollutant::Co),
            "so2" => Some(Pollutant::So2),
            "hcho" | "formaldehyde" => Some(Pollutant::Hcho),
            _ => None,
        }
    }
}

impl fmt::Display for Pollutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pollutant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pollutant::parse(s).ok_or_else(|| format!("Unknown pollutant: {}", s))
    }
}

/// Weather variables merged into canonical records as context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherVariable {
    Temperature,
    Humidity,
    WindSpeed,
    WindDirection,
    Pressure,
}

impl WeatherVariable {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeatherVariable::Temperature => "temperature",
            WeatherVariable::Humidity => "humidity",
            WeatherVariable::WindSpeed => "wind_speed",
            WeatherVariable::WindDirection => "wind_direction",
            WeatherVariable::Pressure => "pressure",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace(' ', "_").as_str() {
            "temperature" | "temp" => Some(WeatherVariable::Temperature),
            "humidity" | "relativehumidity" | "relative_humidity" => {
                Some(WeatherVariable::Humidity)
            }
            "wind_speed" | "windspeed" => Some(WeatherVariable::WindSpeed),
            "wind_direction" | "winddirection" | "wind_deg" => {
                Some(WeatherVariable::WindDirection)
            }
            "pressure" => Some(WeatherVariable::Pressure),
            _ => None,
        }
    }
}

/// What a raw reading measures: a pollutant concentration or a weather variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Pollutant(Pollutant),
    Weather(WeatherVariable),
}

impl Parameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Parameter::Pollutant(p) => p.as_str(),
            Parameter::Weather(w) => w.as_str(),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Pollutant::parse(name)
            .map(Parameter::Pollutant)
            .or_else(|| WeatherVariable::parse(name).map(Parameter::Weather))
    }

    pub fn pollutant(&self) -> Option<Pollutant> {
        match self {
            Parameter::Pollutant(p) => Some(*p),
            Parameter::Weather(_) => None,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Sources and raw readings
// ============================================================================

/// Kind of upstream source
///
/// Ordering matters: ground sensors sort first because they are the primary
/// value in a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Ground,
    Satellite,
    Weather,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Ground => "ground",
            SourceKind::Satellite => "satellite",
            SourceKind::Weather => "weather",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ground" => Some(SourceKind::Ground),
            "satellite" => Some(SourceKind::Satellite),
            "weather" => Some(SourceKind::Weather),
            _ => None,
        }
    }
}

/// Provenance of a reading
///
/// `simulated` is recorded for audit only; nothing downstream branches on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceInfo {
    pub kind: SourceKind,
    /// Provider name, e.g. "TEMPO", "OpenAQ", "OpenWeather"
    pub provider: String,
    #[serde(default)]
    pub simulated: bool,
}

impl SourceInfo {
    pub fn new(kind: SourceKind, provider: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            simulated: false,
        }
    }

    pub fn simulated(kind: SourceKind, provider: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            simulated: true,
        }
    }

    /// Label used in `contributing_sources`, e.g. "ground:OpenAQ"
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.provider)
    }
}

/// Upstream quality flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    Good,
    Unknown,
    Suspect,
    Invalid,
}

impl QualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityFlag::Good => "good",
            QualityFlag::Unknown => "unknown",
            QualityFlag::Suspect => "suspect",
            QualityFlag::Invalid => "invalid",
        }
    }

    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "good" | "valid" | "ok" => QualityFlag::Good,
            "suspect" | "questionable" => QualityFlag::Suspect,
            "invalid" | "bad" => QualityFlag::Invalid,
            _ => QualityFlag::Unknown,
        }
    }
}

/// A single measurement as produced by an ingestion adapter
///
/// Immutable once created. `unit` is the provider's unit string; the
/// harmonizer converts it to the canonical unit or rejects the reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub source: SourceInfo,
    /// Measured pollutant or weather variable
    pub parameter: Parameter,
    pub value: f64,
    pub unit: String,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
    pub quality_flag: QualityFlag,
}

impl RawReading {
    /// Content fingerprint used to stage readings idempotently
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.source.provider.as_bytes());
        hasher.update(b"|");
        hasher.update(self.parameter.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.value.to_bits().to_le_bytes());
        hasher.update(self.unit.as_bytes());
        hasher.update(self.lat.to_bits().to_le_bytes());
        hasher.update(self.lon.to_bits().to_le_bytes());
        hasher.update(self.timestamp.timestamp_millis().to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// Spatial binning
// ============================================================================

/// A requested location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Identifier of a spatial grid cell: integer cell indices at the configured
/// bin size. Rendered as `"<lat_idx>:<lon_idx>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationBinId {
    pub lat_idx: i64,
    pub lon_idx: i64,
}

impl fmt::Display for LocationBinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lat_idx, self.lon_idx)
    }
}

impl FromStr for LocationBinId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = s
            .split_once(':')
            .ok_or_else(|| format!("Malformed location bin id: {}", s))?;
        Ok(Self {
            lat_idx: lat
                .parse()
                .map_err(|_| format!("Malformed location bin id: {}", s))?,
            lon_idx: lon
                .parse()
                .map_err(|_| format!("Malformed location bin id: {}", s))?,
        })
    }
}

/// Regular lat/lon grid that maps coordinates to bins
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialGrid {
    /// Cell edge in degrees
    pub bin_size_deg: f64,
}

impl SpatialGrid {
    pub fn new(bin_size_deg: f64) -> Self {
        Self { bin_size_deg }
    }

    pub fn bin_for(&self, lat: f64, lon: f64) -> LocationBinId {
        LocationBinId {
            lat_idx: (lat / self.bin_size_deg).round() as i64,
            lon_idx: (lon / self.bin_size_deg).round() as i64,
        }
    }

    pub fn centroid(&self, bin: LocationBinId) -> Location {
        Location {
            lat: bin.lat_idx as f64 * self.bin_size_deg,
            lon: bin.lon_idx as f64 * self.bin_size_deg,
        }
    }
}

// ============================================================================
// Harmonized and canonical records
// ============================================================================

/// Upsert key of a canonical record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub location_bin_id: LocationBinId,
    pub hour_bucket: DateTime<Utc>,
    pub pollutant: Pollutant,
}

/// Weather context attached to a record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub pressure: Option<f64>,
    /// Timestamp of the weather observation(s) merged in
    pub observed_at: Option<DateTime<Utc>>,
}

impl WeatherSnapshot {
    pub fn get(&self, variable: WeatherVariable) -> Option<f64> {
        match variable {
            WeatherVariable::Temperature => self.temperature,
            WeatherVariable::Humidity => self.humidity,
            WeatherVariable::WindSpeed => self.wind_speed,
            WeatherVariable::WindDirection => self.wind_direction,
            WeatherVariable::Pressure => self.pressure,
        }
    }

    pub fn set(&mut self, variable: WeatherVariable, value: f64) {
        let slot = match variable {
            WeatherVariable::Temperature => &mut self.temperature,
            WeatherVariable::Humidity => &mut self.humidity,
            WeatherVariable::WindSpeed => &mut self.wind_speed,
            WeatherVariable::WindDirection => &mut self.wind_direction,
            WeatherVariable::Pressure => &mut self.pressure,
        };
        *slot = Some(value);
    }

    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.wind_speed.is_none()
            && self.wind_direction.is_none()
            && self.pressure.is_none()
    }
}

/// One source's contribution to a harmonized cell, in canonical units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceValue {
    pub source: SourceInfo,
    /// Mean of this source's readings in the cell
    pub value: f64,
    pub reading_count: usize,
    /// Worst quality flag among the merged readings
    pub quality: QualityFlag,
}

/// Harmonizer output awaiting validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarmonizedCandidate {
    pub key: RecordKey,
    /// Bin centroid
    pub lat: f64,
    pub lon: f64,
    /// Merged value: ground mean when any ground source exists, else satellite mean
    pub value: f64,
    /// Contributing sources, ground first, then by provider name
    pub sources: Vec<SourceValue>,
    pub weather: WeatherSnapshot,
}

/// Confidence band derived from the confidence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    Low,
    Medium,
    High,
}

impl ConfidenceBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::Low => "low",
            ConfidenceBand::Medium => "medium",
            ConfidenceBand::High => "high",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "low" => Some(ConfidenceBand::Low),
            "medium" => Some(ConfidenceBand::Medium),
            "high" => Some(ConfidenceBand::High),
            _ => None,
        }
    }

    /// The next band down (low stays low)
    pub fn demoted(&self) -> Self {
        match self {
            ConfidenceBand::High => ConfidenceBand::Medium,
            ConfidenceBand::Medium | ConfidenceBand::Low => ConfidenceBand::Low,
        }
    }
}

/// Harmonized, validated measurement for one location bin / hour / pollutant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub location_bin_id: LocationBinId,
    pub hour_bucket: DateTime<Utc>,
    pub pollutant: Pollutant,
    /// Bin centroid
    pub lat: f64,
    pub lon: f64,
    /// Value in the pollutant's canonical unit (µg/m³)
    pub value: f64,
    pub contributing_sources: Vec<String>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub band: ConfidenceBand,
    /// Why the record was tagged low or demoted
    pub reason: Option<String>,
    /// Largest cross-source relative discrepancy, when ≥2 sources contributed
    pub discrepancy: Option<f64>,
    pub anomaly: bool,
    pub weather: WeatherSnapshot,
}

impl CanonicalRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            location_bin_id: self.location_bin_id,
            hour_bucket: self.hour_bucket,
            pollutant: self.pollutant,
        }
    }
}

/// Convert stored epoch seconds back to a UTC timestamp
pub fn from_epoch_seconds(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
