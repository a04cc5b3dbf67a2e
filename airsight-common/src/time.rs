//! Timestamp utilities
//!
//! Canonical records are bucketed by UTC hour. These helpers keep the
//! truncation and offset arithmetic in one place.

use chrono::{DateTime, Duration, DurationRound, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Truncate a timestamp to the start of its UTC hour
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    // duration_trunc only fails for out-of-range timestamps; fall back to the input
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

/// Whole hours from `from` to `to` (negative when `to` precedes `from`)
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_hours()
}

/// Timestamp `hours` after `ts`
pub fn add_hours(ts: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    ts + Duration::hours(hours)
}
