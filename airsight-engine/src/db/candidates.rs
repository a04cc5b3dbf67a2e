//! Harmonized candidates awaiting validation
//!
//! Keyed by (bin, hour, pollutant). Re-harmonizing a cell overwrites the
//! row and resets `validated`, so the validator re-scores it.

use airsight_common::{Error, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::MAX_LOCK_WAIT_MS;
use crate::types::{
    from_epoch_seconds, HarmonizedCandidate, LocationBinId, Pollutant, RecordKey, SourceValue,
    WeatherSnapshot,
};
use crate::utils::retry_on_lock;

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize {}: {}", what, e)))
}

pub async fn upsert_candidates(
    pool: &SqlitePool,
    candidates: &[HarmonizedCandidate],
) -> Result<usize> {
    if candidates.is_empty() {
        return Ok(0);
    }

    // Serialize before touching the database
    let mut prepared = Vec::with_capacity(candidates.len());
    for c in candidates {
        prepared.push((c, to_json(&c.sources, "sources")?, to_json(&c.weather, "weather")?));
    }
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("upsert_candidates", MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for (c, sources, weather) in &prepared {
            sqlx::query(
                r#"
                INSERT INTO harmonized_candidates (
                    location_bin_id, hour_bucket, pollutant, lat, lon, value,
                    sources, weather, validated, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                ON CONFLICT(location_bin_id, hour_bucket, pollutant) DO UPDATE SET
                    lat = excluded.lat,
                    lon = excluded.lon,
                    value = excluded.value,
                    sources = excluded.sources,
                    weather = excluded.weather,
                    validated = 0,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(c.key.location_bin_id.to_string())
            .bind(c.key.hour_bucket.timestamp())
            .bind(c.key.pollutant.as_str())
            .bind(c.lat)
            .bind(c.lon)
            .bind(c.value)
            .bind(sources)
            .bind(weather)
            .bind(&updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(prepared.len())
    })
    .await
}

fn decode(row: &SqliteRow) -> Result<HarmonizedCandidate> {
    let bin: String = row.get("location_bin_id");
    let hour: i64 = row.get("hour_bucket");
    let pollutant: String = row.get("pollutant");
    let sources: String = row.get("sources");
    let weather: String = row.get("weather");

    let location_bin_id: LocationBinId = bin.parse().map_err(Error::Internal)?;
    let hour_bucket = from_epoch_seconds(hour)
        .ok_or_else(|| Error::Internal(format!("Bad hour_bucket: {}", hour)))?;
    let pollutant: Pollutant = pollutant.parse().map_err(Error::Internal)?;
    let sources: Vec<SourceValue> = serde_json::from_str(&sources)
        .map_err(|e| Error::Internal(format!("Failed to deserialize sources: {}", e)))?;
    let weather: WeatherSnapshot = serde_json::from_str(&weather)
        .map_err(|e| Error::Internal(format!("Failed to deserialize weather: {}", e)))?;

    Ok(HarmonizedCandidate {
        key: RecordKey {
            location_bin_id,
            hour_bucket,
            pollutant,
        },
        lat: row.get("lat"),
        lon: row.get("lon"),
        value: row.get("value"),
        sources,
        weather,
    })
}

/// Candidates not yet validated, in key order
pub async fn load_unvalidated(pool: &SqlitePool, limit: i64) -> Result<Vec<HarmonizedCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM harmonized_candidates
        WHERE validated = 0
        ORDER BY hour_bucket, location_bin_id, pollutant
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode).collect()
}

pub async fn mark_validated(pool: &SqlitePool, keys: &[RecordKey]) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }

    retry_on_lock("mark_validated", MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for key in keys {
            sqlx::query(
                r#"
                UPDATE harmonized_candidates SET validated = 1
                WHERE location_bin_id = ? AND hour_bucket = ? AND pollutant = ?
                "#,
            )
            .bind(key.location_bin_id.to_string())
            .bind(key.hour_bucket.timestamp())
            .bind(key.pollutant.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;
    use crate::types::{QualityFlag, SourceInfo, SourceKind};
    use chrono::TimeZone;

    fn candidate(value: f64) -> HarmonizedCandidate {
        HarmonizedCandidate {
            key: RecordKey {
                location_bin_id: LocationBinId { lat_idx: 341, lon_idx: -1182 },
                hour_bucket: Utc.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap(),
                pollutant: Pollutant::No2,
            },
            lat: 34.1,
            lon: -118.2,
            value,
            sources: vec![SourceValue {
                source: SourceInfo::new(SourceKind::Ground, "OpenAQ"),
                value,
                reading_count: 1,
                quality: QualityFlag::Good,
            }],
            weather: WeatherSnapshot::default(),
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_and_resets_validation() {
        let pool = init_memory_pool().await.unwrap();

        upsert_candidates(&pool, &[candidate(10.0)]).await.unwrap();
        mark_validated(&pool, &[candidate(10.0).key]).await.unwrap();
        assert!(load_unvalidated(&pool, 10).await.unwrap().is_empty());

        upsert_candidates(&pool, &[candidate(12.0)]).await.unwrap();
        let pending = load_unvalidated(&pool, 10).await.unwrap();
        assert_eq!(pending, vec![candidate(12.0)]);
    }
}
