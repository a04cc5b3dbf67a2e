//! Active model registry
//!
//! One `Arc<ActiveModel>` per pollutant. A forecast clones the `Arc` once and
//! keeps that snapshot for the whole call, so a concurrent swap never changes
//! the model underneath it. Swaps happen only after the database promotion
//! has committed.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

use airsight_common::events::{EventBus, PipelineEvent};

use crate::db::models::{self as model_store, StoredModel};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{GradientBoostedModel, ModelMetrics};
use crate::types::Pollutant;

/// A fitted model with everything a forecast needs to use it
#[derive(Debug, Clone)]
pub struct ActiveModel {
    pub pollutant: Pollutant,
    pub version: i64,
    pub model: GradientBoostedModel,
    /// Column order the model was trained with
    pub feature_columns: Vec<String>,
    pub metrics: ModelMetrics,
    pub training_rows: usize,
    pub trained_at: DateTime<Utc>,
}

impl ActiveModel {
    fn from_stored(stored: StoredModel) -> PipelineResult<Self> {
        let model: GradientBoostedModel = serde_json::from_str(&stored.model_json)?;
        Ok(Self {
            pollutant: stored.pollutant,
            version: stored.version,
            model,
            feature_columns: stored.feature_columns,
            metrics: stored.metrics,
            training_rows: stored.training_rows.max(0) as usize,
            trained_at: stored.trained_at,
        })
    }

    fn to_stored(&self) -> PipelineResult<StoredModel> {
        Ok(StoredModel {
            pollutant: self.pollutant,
            version: self.version,
            model_json: serde_json::to_string(&self.model)?,
            feature_columns: self.feature_columns.clone(),
            metrics: self.metrics,
            training_rows: self.training_rows as i64,
            trained_at: self.trained_at,
        })
    }
}

/// Versioned per-pollutant model handles
pub struct ModelRegistry {
    db: SqlitePool,
    events: EventBus,
    active: RwLock<HashMap<Pollutant, Arc<ActiveModel>>>,
    training_locks: HashMap<Pollutant, Arc<Mutex<()>>>,
}

impl ModelRegistry {
    pub fn new(db: SqlitePool, events: EventBus) -> Self {
        let training_locks = Pollutant::ALL
            .iter()
            .map(|p| (*p, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            db,
            events,
            active: RwLock::new(HashMap::new()),
            training_locks,
        }
    }

    /// Load every persisted model into memory; returns how many loaded
    ///
    /// A row that fails to deserialize is logged and skipped.
    pub async fn load_persisted(&self) -> PipelineResult<usize> {
        let stored = model_store::load_all(&self.db).await?;
        let mut active = self.active.write().await;
        let mut loaded = 0;

        for row in stored {
            let pollutant = row.pollutant;
            match ActiveModel::from_stored(row) {
                Ok(model) => {
                    info!(
                        pollutant = %pollutant,
                        version = model.version,
                        r2 = model.metrics.r2,
                        "Loaded persisted model"
                    );
                    active.insert(pollutant, Arc::new(model));
                    loaded += 1;
                }
                Err(e) => {
                    error!(
                        pollutant = %pollutant,
                        error = %e,
                        "Persisted model is unreadable, skipping"
                    );
                }
            }
        }

        Ok(loaded)
    }

    /// Snapshot of the active model
    pub async fn get(&self, pollutant: Pollutant) -> Option<Arc<ActiveModel>> {
        self.active.read().await.get(&pollutant).cloned()
    }

    pub async fn active_versions(&self) -> HashMap<Pollutant, i64> {
        self.active
            .read()
            .await
            .iter()
            .map(|(p, m)| (*p, m.version))
            .collect()
    }

    /// Lock serializing training of one pollutant
    pub fn training_lock(&self, pollutant: Pollutant) -> Arc<Mutex<()>> {
        // Every pollutant gets a lock at construction
        self.training_locks
            .get(&pollutant)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())))
    }

    pub async fn next_version(&self, pollutant: Pollutant) -> PipelineResult<i64> {
        Ok(model_store::next_version(&self.db, pollutant).await?)
    }

    /// Stage, promote, then swap the in-memory handle
    ///
    /// On failure the previous model stays active, an alert event is
    /// emitted and `ModelPersistence` is returned.
    pub async fn promote(&self, model: ActiveModel) -> PipelineResult<Arc<ActiveModel>> {
        let pollutant = model.pollutant;

        if let Err(e) = self.persist(&model).await {
            let message = e.to_string();
            error!(
                pollutant = %pollutant,
                error = %message,
                "Model persistence failed; keeping previous model"
            );
            self.events.emit_lossy(PipelineEvent::ModelAlert {
                pollutant: pollutant.to_string(),
                message: message.clone(),
                timestamp: Utc::now(),
            });
            return Err(PipelineError::ModelPersistence { pollutant, message });
        }

        let model = Arc::new(model);
        let previous = self
            .active
            .write()
            .await
            .insert(pollutant, Arc::clone(&model));

        info!(
            pollutant = %pollutant,
            version = model.version,
            previous_version = previous.as_ref().map(|m| m.version),
            r2 = model.metrics.r2,
            rmse = model.metrics.rmse,
            "Activated new model"
        );
        self.events.emit_lossy(PipelineEvent::ModelSwapped {
            pollutant: pollutant.to_string(),
            version: model.version,
            r2: model.metrics.r2,
            rmse: model.metrics.rmse,
            timestamp: Utc::now(),
        });

        Ok(model)
    }

    async fn persist(&self, model: &ActiveModel) -> PipelineResult<()> {
        let stored = model.to_stored()?;
        model_store::write_staging(&self.db, &stored).await?;
        model_store::promote_staged(&self.db, model.pollutant).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;
    use crate::model::GbtParams;

    fn tiny_model(pollutant: Pollutant, version: i64) -> ActiveModel {
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64]).collect();
        let targets: Vec<f64> = (0..20).map(|i| i as f64 * 2.0).collect();
        let params = GbtParams {
            n_trees: 5,
            ..GbtParams::default()
        };
        ActiveModel {
            pollutant,
            version,
            model: GradientBoostedModel::fit(&rows, &targets, &params).unwrap(),
            feature_columns: vec!["x".to_string()],
            metrics: ModelMetrics::evaluate(&targets, &targets),
            training_rows: 20,
            trained_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_promote_swaps_and_persists() {
        let pool = init_memory_pool().await.unwrap();
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let registry = ModelRegistry::new(pool.clone(), events);

        assert!(registry.get(Pollutant::O3).await.is_none());
        registry.promote(tiny_model(Pollutant::O3, 1)).await.unwrap();

        assert_eq!(registry.get(Pollutant::O3).await.unwrap().version, 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::ModelSwapped { version: 1, .. }
        ));

        // A fresh registry over the same database sees the persisted model
        let reloaded = ModelRegistry::new(pool, EventBus::new(16));
        assert_eq!(reloaded.load_persisted().await.unwrap(), 1);
        let model = reloaded.get(Pollutant::O3).await.unwrap();
        let expected = tiny_model(Pollutant::O3, 1).model.predict(&[3.0]);
        assert_eq!(model.model.predict(&[3.0]), expected);
    }

    #[tokio::test]
    async fn test_snapshot_survives_swap() {
        let pool = init_memory_pool().await.unwrap();
        let registry = ModelRegistry::new(pool, EventBus::new(16));

        registry.promote(tiny_model(Pollutant::No2, 1)).await.unwrap();
        let snapshot = registry.get(Pollutant::No2).await.unwrap();
        registry.promote(tiny_model(Pollutant::No2, 2)).await.unwrap();

        assert_eq!(snapshot.version, 1);
        assert_eq!(registry.get(Pollutant::No2).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_previous_model_and_alerts() {
        let pool = init_memory_pool().await.unwrap();
        let events = EventBus::new(16);
        let registry = ModelRegistry::new(pool.clone(), events.clone());
        registry.promote(tiny_model(Pollutant::Pm10, 1)).await.unwrap();

        let mut rx = events.subscribe();
        sqlx::query("DROP TABLE model_staging").execute(&pool).await.unwrap();

        let result = registry.promote(tiny_model(Pollutant::Pm10, 2)).await;
        assert!(matches!(result, Err(PipelineError::ModelPersistence { .. })));
        assert_eq!(registry.get(Pollutant::Pm10).await.unwrap().version, 1);
        assert!(matches!(rx.recv().await.unwrap(), PipelineEvent::ModelAlert { .. }));
    }
}
