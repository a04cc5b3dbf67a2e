//! Raw reading staging
//!
//! Readings are keyed by content fingerprint, so re-ingesting the same
//! upstream payload is a no-op.

use airsight_common::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::MAX_LOCK_WAIT_MS;
use crate::types::{Parameter, QualityFlag, RawReading, SourceInfo, SourceKind};
use crate::utils::retry_on_lock;

/// A staged reading with its row id
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    pub id: i64,
    pub reading: RawReading,
}

/// Stage readings; returns how many were new
pub async fn insert_readings(pool: &SqlitePool, readings: &[RawReading]) -> Result<usize> {
    if readings.is_empty() {
        return Ok(0);
    }
    let ingested_at = Utc::now().to_rfc3339();

    retry_on_lock("insert_readings", MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        let mut inserted = 0usize;

        for reading in readings {
            let result = sqlx::query(
                r#"
                INSERT INTO raw_readings (
                    fingerprint, source_kind, provider, simulated, parameter,
                    value, unit, lat, lon, observed_at_ms, quality_flag, ingested_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(fingerprint) DO NOTHING
                "#,
            )
            .bind(reading.fingerprint())
            .bind(reading.source.kind.as_str())
            .bind(&reading.source.provider)
            .bind(reading.source.simulated)
            .bind(reading.parameter.as_str())
            .bind(reading.value)
            .bind(&reading.unit)
            .bind(reading.lat)
            .bind(reading.lon)
            .bind(reading.timestamp.timestamp_millis())
            .bind(reading.quality_flag.as_str())
            .bind(&ingested_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(inserted)
    })
    .await
}

fn decode(row: &SqliteRow) -> Result<StoredReading> {
    let kind: String = row.get("source_kind");
    let parameter: String = row.get("parameter");
    let quality: String = row.get("quality_flag");
    let observed_at_ms: i64 = row.get("observed_at_ms");

    let kind = SourceKind::parse(&kind)
        .ok_or_else(|| Error::Internal(format!("Unknown source kind in raw_readings: {}", kind)))?;
    let parameter = Parameter::parse(&parameter)
        .ok_or_else(|| Error::Internal(format!("Unknown parameter in raw_readings: {}", parameter)))?;
    let timestamp = Utc
        .timestamp_millis_opt(observed_at_ms)
        .single()
        .ok_or_else(|| Error::Internal(format!("Bad observed_at_ms: {}", observed_at_ms)))?;

    Ok(StoredReading {
        id: row.get("id"),
        reading: RawReading {
            source: SourceInfo {
                kind,
                provider: row.get("provider"),
                simulated: row.get("simulated"),
            },
            parameter,
            value: row.get("value"),
            unit: row.get("unit"),
            lat: row.get("lat"),
            lon: row.get("lon"),
            timestamp,
            quality_flag: QualityFlag::parse(&quality),
        },
    })
}

/// Oldest not-yet-harmonized readings
pub async fn load_pending(pool: &SqlitePool, limit: i64) -> Result<Vec<StoredReading>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM raw_readings
        WHERE harmonized = 0
        ORDER BY id
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode).collect()
}

/// Every accepted reading observed in `[from, to)`, in insertion order
pub async fn load_range(
    pool: &SqlitePool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<StoredReading>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM raw_readings
        WHERE observed_at_ms >= ? AND observed_at_ms < ? AND rejected_reason IS NULL
        ORDER BY id
        "#,
    )
    .bind(from.timestamp_millis())
    .bind(to.timestamp_millis())
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode).collect()
}

/// Mark readings harmonized, recording a rejection reason where given
pub async fn mark_processed(pool: &SqlitePool, outcomes: &[(i64, Option<String>)]) -> Result<()> {
    if outcomes.is_empty() {
        return Ok(());
    }

    retry_on_lock("mark_processed", MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for (id, reason) in outcomes {
            sqlx::query("UPDATE raw_readings SET harmonized = 1, rejected_reason = ? WHERE id = ?")
                .bind(reason)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}

pub async fn count_pending(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_readings WHERE harmonized = 0")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;
    use crate::types::Pollutant;

    fn reading(value: f64, minute: u32) -> RawReading {
        RawReading {
            source: SourceInfo::simulated(SourceKind::Ground, "OpenAQ"),
            parameter: Parameter::Pollutant(Pollutant::Pm25),
            value,
            unit: "µg/m³".to_string(),
            lat: 34.05,
            lon: -118.25,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 10, 14, minute, 0).unwrap(),
            quality_flag: QualityFlag::Good,
        }
    }

    #[tokio::test]
    async fn test_duplicate_readings_are_staged_once() {
        let pool = init_memory_pool().await.unwrap();
        let batch = vec![reading(10.0, 0), reading(11.0, 5)];

        assert_eq!(insert_readings(&pool, &batch).await.unwrap(), 2);
        assert_eq!(insert_readings(&pool, &batch).await.unwrap(), 0);
        assert_eq!(count_pending(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pending_round_trip_and_marking() {
        let pool = init_memory_pool().await.unwrap();
        insert_readings(&pool, &[reading(10.0, 0), reading(11.0, 5)])
            .await
            .unwrap();

        let pending = load_pending(&pool, 100).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].reading, reading(10.0, 0));

        mark_processed(
            &pool,
            &[(pending[0].id, None), (pending[1].id, Some("bad unit".to_string()))],
        )
        .await
        .unwrap();
        assert_eq!(count_pending(&pool).await.unwrap(), 0);

        let from = Utc.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        let accepted = load_range(&pool, from, to).await.unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].reading.value, 10.0);
    }
}
