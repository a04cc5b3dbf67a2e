//! Model registry persistence
//!
//! A trained model is first written to `model_staging`, then promoted into
//! `models` in a single transaction that also clears the staging row. A
//! reader of `models` sees either the previous version or the new one.

use airsight_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::MAX_LOCK_WAIT_MS;
use crate::model::ModelMetrics;
use crate::types::Pollutant;
use crate::utils::retry_on_lock;

/// Serialized model row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredModel {
    pub pollutant: Pollutant,
    pub version: i64,
    pub model_json: String,
    pub feature_columns: Vec<String>,
    pub metrics: ModelMetrics,
    pub training_rows: i64,
    pub trained_at: DateTime<Utc>,
}

/// Write (or overwrite) the staging row for a pollutant
pub async fn write_staging(pool: &SqlitePool, model: &StoredModel) -> Result<()> {
    let feature_columns = serde_json::to_string(&model.feature_columns)
        .map_err(|e| Error::Internal(format!("Failed to serialize feature columns: {}", e)))?;
    let metrics = serde_json::to_string(&model.metrics)
        .map_err(|e| Error::Internal(format!("Failed to serialize metrics: {}", e)))?;
    let trained_at = model.trained_at.to_rfc3339();

    retry_on_lock("write_staging", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO model_staging (
                pollutant, version, model_json, feature_columns, metrics,
                training_rows, trained_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pollutant) DO UPDATE SET
                version = excluded.version,
                model_json = excluded.model_json,
                feature_columns = excluded.feature_columns,
                metrics = excluded.metrics,
                training_rows = excluded.training_rows,
                trained_at = excluded.trained_at
            "#,
        )
        .bind(model.pollutant.as_str())
        .bind(model.version)
        .bind(&model.model_json)
        .bind(&feature_columns)
        .bind(&metrics)
        .bind(model.training_rows)
        .bind(&trained_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

/// Atomically move the staged model into `models`
pub async fn promote_staged(pool: &SqlitePool, pollutant: Pollutant) -> Result<()> {
    retry_on_lock("promote_staged", MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;

        let promoted = sqlx::query(
            r#"
            INSERT INTO models (
                pollutant, version, model_json, feature_columns, metrics,
                training_rows, trained_at
            )
            SELECT pollutant, version, model_json, feature_columns, metrics,
                   training_rows, trained_at
            FROM model_staging
            WHERE pollutant = ?
            ON CONFLICT(pollutant) DO UPDATE SET
                version = excluded.version,
                model_json = excluded.model_json,
                feature_columns = excluded.feature_columns,
                metrics = excluded.metrics,
                training_rows = excluded.training_rows,
                trained_at = excluded.trained_at
            "#,
        )
        .bind(pollutant.as_str())
        .execute(&mut *tx)
        .await?;

        if promoted.rows_affected() != 1 {
            // Dropping tx rolls back
            return Err(Error::NotFound(format!("No staged model for {}", pollutant)));
        }

        sqlx::query("DELETE FROM model_staging WHERE pollutant = ?")
            .bind(pollutant.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    })
    .await
}

fn decode(row: &SqliteRow) -> Result<StoredModel> {
    let pollutant: String = row.get("pollutant");
    let feature_columns: String = row.get("feature_columns");
    let metrics: String = row.get("metrics");
    let trained_at: String = row.get("trained_at");

    Ok(StoredModel {
        pollutant: pollutant.parse().map_err(Error::Internal)?,
        version: row.get("version"),
        model_json: row.get("model_json"),
        feature_columns: serde_json::from_str(&feature_columns)
            .map_err(|e| Error::Internal(format!("Failed to deserialize feature columns: {}", e)))?,
        metrics: serde_json::from_str(&metrics)
            .map_err(|e| Error::Internal(format!("Failed to deserialize metrics: {}", e)))?,
        training_rows: row.get("training_rows"),
        trained_at: DateTime::parse_from_rfc3339(&trained_at)
            .map_err(|e| Error::Internal(format!("Failed to parse trained_at: {}", e)))?
            .with_timezone(&Utc),
    })
}

/// Every active model
pub async fn load_all(pool: &SqlitePool) -> Result<Vec<StoredModel>> {
    let rows = sqlx::query("SELECT * FROM models ORDER BY pollutant")
        .fetch_all(pool)
        .await?;
    rows.iter().map(decode).collect()
}

pub async fn load_active(pool: &SqlitePool, pollutant: Pollutant) -> Result<Option<StoredModel>> {
    let row = sqlx::query("SELECT * FROM models WHERE pollutant = ?")
        .bind(pollutant.as_str())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(decode).transpose()
}

/// Version number for the next model of a pollutant
pub async fn next_version(pool: &SqlitePool, pollutant: Pollutant) -> Result<i64> {
    let current: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM models WHERE pollutant = ?")
            .bind(pollutant.as_str())
            .fetch_one(pool)
            .await?;
    Ok(current.unwrap_or(0) + 1)
}
