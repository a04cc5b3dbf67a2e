//! Database access for airsight-engine
//!
//! One SQLite file in the root folder holds the raw-reading staging area,
//! harmonized candidates, canonical records and the model registry. Hour
//! buckets are stored as epoch seconds, raw timestamps as epoch milliseconds.

pub mod candidates;
pub mod canonical;
pub mod models;
pub mod raw_readings;

use airsight_common::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;

/// Upper bound on how long a writer waits out lock contention
pub const MAX_LOCK_WAIT_MS: u64 = 5000;

/// Initialize database connection pool and create tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&db_url)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with all tables
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create pipeline tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL UNIQUE,
            source_kind TEXT NOT NULL,
            provider TEXT NOT NULL,
            simulated INTEGER NOT NULL DEFAULT 0,
            parameter TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            observed_at_ms INTEGER NOT NULL,
            quality_flag TEXT NOT NULL,
            ingested_at TEXT NOT NULL,
            harmonized INTEGER NOT NULL DEFAULT 0,
            rejected_reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_readings_pending ON raw_readings (harmonized, observed_at_ms)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_readings_observed ON raw_readings (observed_at_ms)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harmonized_candidates (
            location_bin_id TEXT NOT NULL,
            hour_bucket INTEGER NOT NULL,
            pollutant TEXT NOT NULL,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            value REAL NOT NULL,
            sources TEXT NOT NULL,
            weather TEXT NOT NULL,
            validated INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (location_bin_id, hour_bucket, pollutant)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_records (
            location_bin_id TEXT NOT NULL,
            hour_bucket INTEGER NOT NULL,
            pollutant TEXT NOT NULL,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            value REAL NOT NULL,
            contributing_sources TEXT NOT NULL,
            confidence REAL NOT NULL,
            band TEXT NOT NULL,
            reason TEXT,
            discrepancy REAL,
            anomaly INTEGER NOT NULL DEFAULT 0,
            weather TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (location_bin_id, hour_bucket, pollutant)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_canonical_pollutant_hour ON canonical_records (pollutant, hour_bucket)",
    )
    .execute(pool)
    .await?;

    for table in ["models", "model_staging"] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                pollutant TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                model_json TEXT NOT NULL,
                feature_columns TEXT NOT NULL,
                metrics TEXT NOT NULL,
                training_rows INTEGER NOT NULL,
                trained_at TEXT NOT NULL
            )
            "#,
            table
        ))
        .execute(pool)
        .await?;
    }

    tracing::info!(
        "Database tables initialized (raw_readings, harmonized_candidates, canonical_records, models, model_staging)"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_tables_is_idempotent() {
        let pool = init_memory_pool().await.unwrap();
        init_tables(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec![
                "canonical_records",
                "harmonized_candidates",
                "model_staging",
                "models",
                "raw_readings"
            ]
        );
    }

    #[tokio::test]
    async fn test_file_pool_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("airsight.db");
        let pool = init_database_pool(&path).await.unwrap();
        assert!(path.exists());
        pool.close().await;
    }
}
