//! Canonical record store
//!
//! Upserts are keyed by (location_bin_id, hour_bucket, pollutant);
//! last write wins.

use airsight_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::MAX_LOCK_WAIT_MS;
use crate::types::{
    from_epoch_seconds, CanonicalRecord, ConfidenceBand, LocationBinId, Pollutant,
    WeatherSnapshot,
};
use crate::utils::retry_on_lock;

pub async fn upsert_records(pool: &SqlitePool, records: &[CanonicalRecord]) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }

    let mut prepared = Vec::with_capacity(records.len());
    for r in records {
        let sources = serde_json::to_string(&r.contributing_sources)
            .map_err(|e| Error::Internal(format!("Failed to serialize sources: {}", e)))?;
        let weather = serde_json::to_string(&r.weather)
            .map_err(|e| Error::Internal(format!("Failed to serialize weather: {}", e)))?;
        prepared.push((r, sources, weather));
    }
    let updated_at = Utc::now().to_rfc3339();

    retry_on_lock("upsert_records", MAX_LOCK_WAIT_MS, || async {
        let mut tx = pool.begin().await?;
        for (r, sources, weather) in &prepared {
            sqlx::query(
                r#"
                INSERT INTO canonical_records (
                    location_bin_id, hour_bucket, pollutant, lat, lon, value,
                    contributing_sources, confidence, band, reason, discrepancy,
                    anomaly, weather, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(location_bin_id, hour_bucket, pollutant) DO UPDATE SET
                    lat = excluded.lat,
                    lon = excluded.lon,
                    value = excluded.value,
                    contributing_sources = excluded.contributing_sources,
                    confidence = excluded.confidence,
                    band = excluded.band,
                    reason = excluded.reason,
                    discrepancy = excluded.discrepancy,
                    anomaly = excluded.anomaly,
                    weather = excluded.weather,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(r.location_bin_id.to_string())
            .bind(r.hour_bucket.timestamp())
            .bind(r.pollutant.as_str())
            .bind(r.lat)
            .bind(r.lon)
            .bind(r.value)
            .bind(sources)
            .bind(r.confidence)
            .bind(r.band.as_str())
            .bind(&r.reason)
            .bind(r.discrepancy)
            .bind(r.anomaly)
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

fn decode(row: &SqliteRow) -> Result<CanonicalRecord> {
    let bin: String = row.get("location_bin_id");
    let hour: i64 = row.get("hour_bucket");
    let pollutant: String = row.get("pollutant");
    let band: String = row.get("band");
    let sources: String = row.get("contributing_sources");
    let weather: String = row.get("weather");

    Ok(CanonicalRecord {
        location_bin_id: bin.parse::<LocationBinId>().map_err(Error::Internal)?,
        hour_bucket: from_epoch_seconds(hour)
            .ok_or_else(|| Error::Internal(format!("Bad hour_bucket: {}", hour)))?,
        pollutant: pollutant.parse::<Pollutant>().map_err(Error::Internal)?,
        lat: row.get("lat"),
        lon: row.get("lon"),
        value: row.get("value"),
        contributing_sources: serde_json::from_str(&sources)
            .map_err(|e| Error::Internal(format!("Failed to deserialize sources: {}", e)))?,
        confidence: row.get("confidence"),
        band: ConfidenceBand::parse(&band)
            .ok_or_else(|| Error::Internal(format!("Unknown confidence band: {}", band)))?,
        reason: row.get("reason"),
        discrepancy: row.get("discrepancy"),
        anomaly: row.get("anomaly"),
        weather: serde_json::from_str::<WeatherSnapshot>(&weather)
            .map_err(|e| Error::Internal(format!("Failed to deserialize weather: {}", e)))?,
    })
}

/// Most recent `hours` of records for one bin at or before `until`, oldest first
pub async fn load_history(
    pool: &SqlitePool,
    bin: LocationBinId,
    pollutant: Pollutant,
    until: DateTime<Utc>,
    hours: i64,
) -> Result<Vec<CanonicalRecord>> {
    let from = until.timestamp() - hours * 3600;
    let rows = sqlx::query(
        r#"
        SELECT * FROM canonical_records
        WHERE location_bin_id = ? AND pollutant = ? AND hour_bucket > ? AND hour_bucket <= ?
        ORDER BY hour_bucket
        "#,
    )
    .bind(bin.to_string())
    .bind(pollutant.as_str())
    .bind(from)
    .bind(until.timestamp())
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode).collect()
}

/// Latest record for one bin
pub async fn latest(
    pool: &SqlitePool,
    bin: LocationBinId,
    pollutant: Pollutant,
) -> Result<Option<CanonicalRecord>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM canonical_records
        WHERE location_bin_id = ? AND pollutant = ?
        ORDER BY hour_bucket DESC
        LIMIT 1
        "#,
    )
    .bind(bin.to_string())
    .bind(pollutant.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(decode).transpose()
}

/// Most recent `limit` records of a pollutant, grouped by bin, oldest first
pub async fn load_for_training(
    pool: &SqlitePool,
    pollutant: Pollutant,
    limit: i64,
) -> Result<Vec<CanonicalRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM (
            SELECT * FROM canonical_records
            WHERE pollutant = ?
            ORDER BY hour_bucket DESC
            LIMIT ?
        )
        ORDER BY location_bin_id, hour_bucket
        "#,
    )
    .bind(pollutant.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode).collect()
}

pub async fn count_for_pollutant(pool: &SqlitePool, pollutant: Pollutant) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM canonical_records WHERE pollutant = ?")
        .bind(pollutant.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}
