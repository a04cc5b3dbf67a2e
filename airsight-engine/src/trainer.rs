//! Per-pollutant model training
//!
//! Pools canonical records across locations, builds the feature matrix,
//! splits chronologically, fits on a blocking thread and hands the result
//! to the registry. Failures never escape: each run ends in a
//! `TrainingOutcome`, and the previously active model stays in place.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use airsight_common::events::{EventBus, PipelineEvent};

use crate::config::TrainerConfig;
use crate::db::canonical;
use crate::error::{PipelineError, PipelineResult};
use crate::features::{build_training_matrix, FeatureMatrix, HourlySeries};
use crate::model::{GbtParams, GradientBoostedModel, ModelMetrics};
use crate::registry::{ActiveModel, ModelRegistry};
use crate::types::{CanonicalRecord, LocationBinId, Pollutant};

/// Result of one training run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainingOutcome {
    Trained {
        version: i64,
        metrics: ModelMetrics,
        rows: usize,
    },
    /// Below the row floor; the prior model is retained
    Skipped { available: usize, required: usize },
    Failed { reason: String },
}

impl TrainingOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TrainingOutcome::Failed { .. })
    }
}

/// Feature matrix over every location's series, in chronological order
pub fn build_pooled_matrix(records: &[CanonicalRecord]) -> FeatureMatrix {
    let mut by_bin: BTreeMap<LocationBinId, Vec<CanonicalRecord>> = BTreeMap::new();
    for record in records {
        by_bin
            .entry(record.location_bin_id)
            .or_default()
            .push(record.clone());
    }

    let mut matrix = FeatureMatrix::empty();
    for bin_records in by_bin.values() {
        if let Some(series) = HourlySeries::from_records(bin_records) {
            matrix.extend(build_training_matrix(&series));
        }
    }
    matrix.sort_chronologically();
    matrix
}

fn fit_and_evaluate(
    matrix: FeatureMatrix,
    params: GbtParams,
    train_fraction: f64,
) -> Result<(GradientBoostedModel, ModelMetrics), String> {
    let (train, test) = matrix.split(train_fraction);
    if train.is_empty() || test.is_empty() {
        return Err(format!(
            "Chronological split left {} training and {} test rows",
            train.len(),
            test.len()
        ));
    }

    let model =
        GradientBoostedModel::fit(&train.rows, &train.targets, &params).map_err(|e| e.to_string())?;

    let predicted = model.predict_batch(&test.rows);
    if predicted.iter().any(|p| !p.is_finite()) {
        return Err("Model produced non-finite predictions on held-out rows".to_string());
    }

    let metrics = ModelMetrics::evaluate(&test.targets, &predicted);
    if !metrics.is_finite() {
        return Err(format!("Non-finite evaluation metrics: {:?}", metrics));
    }
    Ok((model, metrics))
}

/// Trainer
pub struct Trainer {
    db: SqlitePool,
    config: TrainerConfig,
    registry: Arc<ModelRegistry>,
    events: EventBus,
}

impl Trainer {
    pub fn new(
        db: SqlitePool,
        config: TrainerConfig,
        registry: Arc<ModelRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            config,
            registry,
            events,
        }
    }

    /// Train one pollutant; serialized per pollutant
    pub async fn train(&self, pollutant: Pollutant) -> TrainingOutcome {
        let lock = self.registry.training_lock(pollutant);
        let _guard = lock.lock().await;

        match self.try_train(pollutant).await {
            Ok(outcome) => outcome,
            Err(PipelineError::InsufficientData {
                available,
                required,
                ..
            }) => {
                info!(
                    pollutant = %pollutant,
                    available,
                    required,
                    "Skipping training: insufficient data, keeping previous model"
                );
                self.events.emit_lossy(PipelineEvent::TrainingSkipped {
                    pollutant: pollutant.to_string(),
                    available_rows: available,
                    required_rows: required,
                    timestamp: Utc::now(),
                });
                TrainingOutcome::Skipped {
                    available,
                    required,
                }
            }
            Err(e) => {
                error!(pollutant = %pollutant, error = %e, "Training failed, keeping previous model");
                TrainingOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_train(&self, pollutant: Pollutant) -> PipelineResult<TrainingOutcome> {
        let records =
            canonical::load_for_training(&self.db, pollutant, self.config.max_training_records)
                .await?;
        let matrix = build_pooled_matrix(&records);

        if matrix.len() < self.config.min_rows {
            return Err(PipelineError::InsufficientData {
                pollutant,
                available: matrix.len(),
                required: self.config.min_rows,
            });
        }

        let rows = matrix.len();
        let feature_columns = matrix.columns.clone();
        let params = GbtParams::from(&self.config);
        let fraction = self.config.train_fraction;
        info!(pollutant = %pollutant, rows, "Training model");

        let (model, metrics) =
            tokio::task::spawn_blocking(move || fit_and_evaluate(matrix, params, fraction))
                .await
                .map_err(|e| PipelineError::Training {
                    pollutant,
                    message: format!("Training task failed: {}", e),
                })?
                .map_err(|message| PipelineError::Training { pollutant, message })?;

        if metrics.r2 < 0.0 {
            warn!(pollutant = %pollutant, r2 = metrics.r2, "Model underperforms the held-out mean");
        }

        let version = self.registry.next_version(pollutant).await?;
        let active = self
            .registry
            .promote(ActiveModel {
                pollutant,
                version,
                model,
                feature_columns,
                metrics,
                training_rows: rows,
                trained_at: Utc::now(),
            })
            .await?;

        Ok(TrainingOutcome::Trained {
            version: active.version,
            metrics: active.metrics,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfidenceBand, WeatherSnapshot};
    use chrono::{Duration, TimeZone};

    fn record(bin: i64, hour: i64, value: f64) -> CanonicalRecord {
        CanonicalRecord {
            location_bin_id: LocationBinId {
                lat_idx: bin,
                lon_idx: 0,
            },
            hour_bucket: Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
                + Duration::hours(hour),
            pollutant: Pollutant::Pm25,
            lat: bin as f64 * 0.1,
            lon: 0.0,
            value,
            contributing_sources: vec![],
            confidence: 0.75,
            band: ConfidenceBand::Medium,
            reason: None,
            discrepancy: None,
            anomaly: false,
            weather: WeatherSnapshot::default(),
        }
    }

    #[test]
    fn test_pooled_matrix_is_chronological_across_bins() {
        let mut records = Vec::new();
        for hour in 0..5 {
            records.push(record(1, hour, 10.0 + hour as f64));
            records.push(record(2, hour, 20.0 + hour as f64));
        }
        let matrix = build_pooled_matrix(&records);

        assert_eq!(matrix.len(), 10);
        assert!(matrix.timestamps.windows(2).all(|w| w[0] <= w[1]));
        // Lags come from the row's own bin
        let lag_1 = matrix.columns.iter().position(|c| c == "lag_1").unwrap();
        let last = matrix.len() - 1;
        assert_eq!(matrix.rows[last][lag_1], matrix.targets[last] - 1.0);
    }

    #[test]
    fn test_fit_and_evaluate_needs_a_test_tail() {
        let records: Vec<CanonicalRecord> = (0..1).map(|h| record(1, h, 1.0)).collect();
        let matrix = build_pooled_matrix(&records);
        assert!(fit_and_evaluate(matrix, GbtParams::default(), 0.8).is_err());
    }
}
