//! Ingestion adapters
//!
//! Each adapter pulls readings from one upstream source and hands them over
//! as `RawReading`s in the provider's own units. Unit conversion and
//! rejection happen in the harmonizer, never here.

pub mod openaq;
pub mod openweather;
pub mod simulated;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::IngestionConfig;
use crate::error::PipelineResult;
use crate::types::{RawReading, SourceKind};

pub use openaq::OpenAqClient;
pub use openweather::OpenWeatherClient;
pub use simulated::SimulatedSource;

/// One upstream source of raw readings
#[async_trait]
pub trait IngestionAdapter: Send + Sync {
    /// Adapter name used in logs and job details
    fn name(&self) -> &str;

    fn source_kind(&self) -> SourceKind;

    /// Fetch the latest readings
    ///
    /// An error fails this adapter only; other adapters still run.
    async fn fetch(&self) -> PipelineResult<Vec<RawReading>>;
}

/// Adapters enabled by configuration
///
/// HTTP adapters are registered when their API key is set. Simulated
/// sources fill in for every kind that has no live adapter.
pub fn build_adapters(config: &IngestionConfig) -> PipelineResult<Vec<Arc<dyn IngestionAdapter>>> {
    let mut adapters: Vec<Arc<dyn IngestionAdapter>> = Vec::new();

    if let Some(key) = &config.openaq_api_key {
        adapters.push(Arc::new(OpenAqClient::new(config, key)?));
    }
    if let Some(key) = &config.openweather_api_key {
        adapters.push(Arc::new(OpenWeatherClient::new(config, key)?));
    }

    if config.simulated {
        for kind in [SourceKind::Satellite, SourceKind::Ground, SourceKind::Weather] {
            if adapters.iter().any(|a| a.source_kind() == kind) {
                continue;
            }
            adapters.push(Arc::new(SimulatedSource::new(
                kind,
                config.stations.clone(),
                config.seed,
            )));
        }
    }

    for adapter in &adapters {
        info!(
            adapter = adapter.name(),
            kind = adapter.source_kind().as_str(),
            "Registered ingestion adapter"
        );
    }
    Ok(adapters)
}
