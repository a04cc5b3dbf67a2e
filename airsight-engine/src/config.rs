//! Pipeline configuration for airsight-engine
//!
//! Loaded from the module's TOML file (see `airsight_common::config` for file
//! resolution). Every field has a built-in default so a missing file still
//! yields a runnable pipeline. API keys additionally resolve from the
//! environment, which wins over TOML.

use airsight_common::config::{load_toml_or_default, LoggingConfig};
use airsight_common::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// Complete configuration for the engine
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub harmonizer: HarmonizerConfig,
    pub validator: ValidatorConfig,
    pub trainer: TrainerConfig,
    pub forecaster: ForecasterConfig,
    pub ingestion: IngestionConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Spatial/temporal bucketing and weather merge
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarmonizerConfig {
    /// Grid cell edge in degrees
    pub bin_size_deg: f64,
    /// Maximum distance (degrees) between a record's cell and a weather reading
    pub weather_radius_deg: f64,
    /// Maximum time gap (hours) between a record's hour and a weather reading
    pub weather_max_gap_hours: i64,
}

impl Default for HarmonizerConfig {
    fn default() -> Self {
        Self {
            bin_size_deg: 0.1,
            weather_radius_deg: 0.5,
            weather_max_gap_hours: 3,
        }
    }
}

/// Cross-source validation policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Relative discrepancy above which a record is tagged low
    pub discrepancy_threshold: f64,
    /// Denominator floor for the relative discrepancy
    pub epsilon: f64,
    /// Reliability weight of ground sensors
    pub ground_reliability: f64,
    /// Reliability weight of satellite retrievals
    pub satellite_reliability: f64,
    /// Multiplier applied to a source's weight when its readings are suspect
    pub suspect_penalty: f64,
    /// Confidence ceiling for single-source records
    pub single_source_ceiling: f64,
    /// Confidence ceiling for records confirmed by ≥2 sources
    pub dual_confirmed_ceiling: f64,
    /// Confidence at or above which a record is "high"
    pub high_threshold: f64,
    /// Confidence at or above which a record is "medium"
    pub medium_threshold: f64,
    /// Confidence cap for records forced into the low band
    pub low_band_cap: f64,
    /// |z| above which a value is flagged anomalous against its trailing window
    pub anomaly_z_threshold: f64,
    /// Hours of same-bin history preceding a record used for its z-score
    pub anomaly_window_hours: i64,
    /// Fewer trailing values than this and no z-score is computed
    pub anomaly_min_samples: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            discrepancy_threshold: 0.30,
            epsilon: 1e-6,
            ground_reliability: 0.95,
            satellite_reliability: 0.80,
            suspect_penalty: 0.8,
            single_source_ceiling: 0.75,
            dual_confirmed_ceiling: 0.95,
            high_threshold: 0.8,
            medium_threshold: 0.6,
            low_band_cap: 0.5,
            anomaly_z_threshold: 3.0,
            anomaly_window_hours: 24,
            anomaly_min_samples: 8,
        }
    }
}

/// Gradient-boosted model training
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Minimum usable rows before a pollutant is trained
    pub min_rows: usize,
    /// Chronological train fraction; the tail is held out
    pub train_fraction: f64,
    pub n_trees: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_leaf: usize,
    /// Candidate split thresholds per feature
    pub max_bins: usize,
    /// Most recent canonical records pulled per pollutant
    pub max_training_records: i64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            min_rows: 1000,
            train_fraction: 0.8,
            n_trees: 100,
            max_depth: 6,
            learning_rate: 0.1,
            min_samples_leaf: 5,
            max_bins: 64,
            max_training_records: 50_000,
        }
    }
}

/// Recursive forecasting and confidence decay
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForecasterConfig {
    pub base_confidence: f64,
    /// Confidence lost per forecast hour
    pub decay_rate: f64,
    pub confidence_floor: f64,
    pub min_horizon_hours: u32,
    pub max_horizon_hours: u32,
    /// Hours of real history loaded behind the forecast origin
    pub history_hours: i64,
    /// Default timeout for serving-layer forecast calls
    pub timeout_ms: u64,
}

impl Default for ForecasterConfig {
    fn default() -> Self {
        Self {
            base_confidence: 0.9,
            decay_rate: 0.01,
            confidence_floor: 0.3,
            min_horizon_hours: 6,
            max_horizon_hours: 72,
            history_hours: 48,
            timeout_ms: 5_000,
        }
    }
}

/// A monitoring station used by the simulated source and the HTTP adapters
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StationConfig {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl StationConfig {
    pub fn new(name: &str, lat: f64, lon: f64) -> Self {
        Self {
            name: name.to_string(),
            lat,
            lon,
        }
    }
}

/// Ingestion adapters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Register simulated satellite, ground and weather sources
    pub simulated: bool,
    pub seed: u64,
    pub stations: Vec<StationConfig>,
    pub openaq_api_key: Option<String>,
    pub openaq_base_url: String,
    pub openweather_api_key: Option<String>,
    pub openweather_base_url: String,
    /// Per-request HTTP timeout
    pub http_timeout_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            simulated: true,
            seed: 42,
            stations: vec![
                StationConfig::new("Los Angeles", 34.05, -118.25),
                StationConfig::new("New York", 40.71, -74.01),
                StationConfig::new("Chicago", 41.88, -87.63),
                StationConfig::new("Houston", 29.76, -95.37),
                StationConfig::new("Phoenix", 33.45, -112.07),
            ],
            openaq_api_key: None,
            openaq_base_url: "https://api.openaq.org/v2".to_string(),
            openweather_api_key: None,
            openweather_base_url: "https://api.openweathermap.org/data/2.5".to_string(),
            http_timeout_secs: 30,
        }
    }
}

/// HTTP surface
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:5731".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load from an optional TOML path, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: PipelineConfig = load_toml_or_default(path);
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment beats TOML for API keys
    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = env_key("AIRSIGHT_OPENAQ_API_KEY") {
            if self.ingestion.openaq_api_key.is_some() {
                warn!("OpenAQ API key found in environment and TOML. Using environment.");
            }
            info!("OpenAQ API key loaded from environment variable");
            self.ingestion.openaq_api_key = Some(key);
        }
        if let Some(key) = env_key("AIRSIGHT_OPENWEATHER_API_KEY") {
            if self.ingestion.openweather_api_key.is_some() {
                warn!("OpenWeather API key found in environment and TOML. Using environment.");
            }
            info!("OpenWeather API key loaded from environment variable");
            self.ingestion.openweather_api_key = Some(key);
        }
    }

    /// Reject settings that would break invariants downstream
    pub fn validate(&self) -> Result<()> {
        let h = &self.harmonizer;
        if !(h.bin_size_deg > 0.0) {
            return Err(Error::Config("harmonizer.bin_size_deg must be > 0".into()));
        }
        if h.weather_radius_deg < 0.0 || h.weather_max_gap_hours < 0 {
            return Err(Error::Config("harmonizer weather limits must be ≥ 0".into()));
        }

        let v = &self.validator;
        if !(v.discrepancy_threshold > 0.0 && v.discrepancy_threshold <= 1.0) {
            return Err(Error::Config(
                "validator.discrepancy_threshold must be in (0, 1]".into(),
            ));
        }
        for (name, value) in [
            ("ground_reliability", v.ground_reliability),
            ("satellite_reliability", v.satellite_reliability),
            ("suspect_penalty", v.suspect_penalty),
            ("single_source_ceiling", v.single_source_ceiling),
            ("dual_confirmed_ceiling", v.dual_confirmed_ceiling),
            ("low_band_cap", v.low_band_cap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("validator.{} must be in [0, 1]", name)));
            }
        }
        if !(v.medium_threshold < v.high_threshold && v.low_band_cap < v.medium_threshold) {
            return Err(Error::Config(
                "validator thresholds must satisfy low_band_cap < medium_threshold < high_threshold"
                    .into(),
            ));
        }

        if v.anomaly_window_hours <= 0 || v.anomaly_min_samples < 2 {
            return Err(Error::Config(
                "validator.anomaly_window_hours must be > 0 and anomaly_min_samples ≥ 2".into(),
            ));
        }

        let t = &self.trainer;
        if !(t.train_fraction > 0.0 && t.train_fraction < 1.0) {
            return Err(Error::Config("trainer.train_fraction must be in (0, 1)".into()));
        }
        if t.n_trees == 0 || t.max_depth == 0 || t.min_samples_leaf == 0 || t.max_bins < 2 {
            return Err(Error::Config(
                "trainer.n_trees, max_depth, min_samples_leaf must be > 0 and max_bins ≥ 2".into(),
            ));
        }
        if !(t.learning_rate > 0.0 && t.learning_rate <= 1.0) {
            return Err(Error::Config("trainer.learning_rate must be in (0, 1]".into()));
        }

        let f = &self.forecaster;
        if !(0.0..=1.0).contains(&f.base_confidence)
            || !(0.0..=1.0).contains(&f.confidence_floor)
            || f.confidence_floor > f.base_confidence
        {
            return Err(Error::Config(
                "forecaster confidences must satisfy 0 ≤ floor ≤ base ≤ 1".into(),
            ));
        }
        if f.decay_rate < 0.0 {
            return Err(Error::Config("forecaster.decay_rate must be ≥ 0".into()));
        }
        if f.min_horizon_hours == 0 || f.min_horizon_hours > f.max_horizon_hours {
            return Err(Error::Config(
                "forecaster horizon bounds must satisfy 0 < min ≤ max".into(),
            ));
        }

        Ok(())
    }
}

fn env_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.validator.discrepancy_threshold, 0.30);
        assert_eq!(config.trainer.min_rows, 1000);
        assert_eq!(config.trainer.n_trees, 100);
        assert_eq!(config.trainer.max_depth, 6);
        assert_eq!(config.forecaster.min_horizon_hours, 6);
        assert_eq!(config.forecaster.max_horizon_hours, 72);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[validator]\ndiscrepancy_threshold = 0.25\n\n[forecaster]\ndecay_rate = 0.02"
        )
        .unwrap();

        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.validator.discrepancy_threshold, 0.25);
        assert_eq!(config.validator.medium_threshold, 0.6);
        assert_eq!(config.forecaster.decay_rate, 0.02);
        assert_eq!(config.trainer.min_rows, 1000);
    }

    #[test]
    fn test_rejects_floor_above_base() {
        let mut config = PipelineConfig::default();
        config.forecaster.confidence_floor = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let mut config = PipelineConfig::default();
        config.validator.discrepancy_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_horizon_bounds() {
        let mut config = PipelineConfig::default();
        config.forecaster.min_horizon_hours = 80;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_env_api_key_beats_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[ingestion]\nopenaq_api_key = \"from-toml\"\nopenweather_api_key = \"from-toml\""
        )
        .unwrap();

        std::env::set_var("AIRSIGHT_OPENAQ_API_KEY", "aq-from-env");
        std::env::set_var("AIRSIGHT_OPENWEATHER_API_KEY", "ow-from-env");
        let config = PipelineConfig::load(Some(file.path()));
        std::env::remove_var("AIRSIGHT_OPENAQ_API_KEY");
        std::env::remove_var("AIRSIGHT_OPENWEATHER_API_KEY");

        let config = config.unwrap();
        assert_eq!(config.ingestion.openaq_api_key.as_deref(), Some("aq-from-env"));
        assert_eq!(
            config.ingestion.openweather_api_key.as_deref(),
            Some("ow-from-env")
        );
    }

    #[test]
    fn test_rejects_empty_anomaly_window() {
        let mut config = PipelineConfig::default();
        config.validator.anomaly_window_hours = 0;
        assert!(config.validate().is_err());
    }
}
