//! Feature engineering
//!
//! One row builder serves both training and forecasting, so the column order
//! stored with a model always matches what the forecaster produces.
//!
//! All history features read strictly before the target hour: lags look up
//! `t − k`, rolling windows cover `[t − w, t − 1]`. Missing inputs are
//! forward-filled from the last known value and flagged in a `*_missing`
//! column; with no prior value the neutral marker 0.0 is used.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::collections::BTreeMap;
use std::f64::consts::TAU;

use crate::types::{CanonicalRecord, WeatherSnapshot, WeatherVariable};

/// Lag offsets in hours
pub const LAGS: [i64; 6] = [1, 2, 3, 6, 12, 24];

/// Rolling mean windows in hours
pub const MEAN_WINDOWS: [i64; 4] = [3, 6, 12, 24];

/// Rolling standard deviation windows in hours
pub const STD_WINDOWS: [i64; 2] = [3, 12];

const WEATHER_FEATURES: [WeatherVariable; 4] = [
    WeatherVariable::Temperature,
    WeatherVariable::Humidity,
    WeatherVariable::WindSpeed,
    WeatherVariable::Pressure,
];

/// Neutral marker for inputs with no history at all
const MISSING: f64 = 0.0;

/// One hour of a location's series
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyPoint {
    pub value: f64,
    pub weather: WeatherSnapshot,
}

/// Hourly value series for one (location bin, pollutant)
#[derive(Debug, Clone, PartialEq)]
pub struct HourlySeries {
    pub lat: f64,
    pub lon: f64,
    points: BTreeMap<DateTime<Utc>, HourlyPoint>,
}

impl HourlySeries {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            points: BTreeMap::new(),
        }
    }

    /// Build from records of a single bin; later duplicates of an hour win
    pub fn from_records(records: &[CanonicalRecord]) -> Option<Self> {
        let first = records.first()?;
        let mut series = Self::new(first.lat, first.lon);
        for record in records {
            series.insert(record.hour_bucket, record.value, record.weather.clone());
        }
        Some(series)
    }

    pub fn insert(&mut self, hour: DateTime<Utc>, value: f64, weather: WeatherSnapshot) {
        self.points.insert(hour, HourlyPoint { value, weather });
    }

    pub fn get(&self, hour: DateTime<Utc>) -> Option<&HourlyPoint> {
        self.points.get(&hour)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first_hour(&self) -> Option<DateTime<Utc>> {
        self.points.keys().next().copied()
    }

    pub fn last_hour(&self) -> Option<DateTime<Utc>> {
        self.points.keys().next_back().copied()
    }

    /// Drop every point after `origin`
    pub fn truncate_after(&mut self, origin: DateTime<Utc>) {
        let _ = self.points.split_off(&(origin + Duration::seconds(1)));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DateTime<Utc>, &HourlyPoint)> {
        self.points.iter()
    }

    /// Most recent value at or before `hour`
    fn last_value_at_or_before(&self, hour: DateTime<Utc>) -> Option<f64> {
        self.points.range(..=hour).next_back().map(|(_, p)| p.value)
    }

    /// Most recent known value of a weather variable strictly before `hour`
    fn last_weather_before(&self, hour: DateTime<Utc>, variable: WeatherVariable) -> Option<f64> {
        self.points
            .range(..hour)
            .rev()
            .find_map(|(_, p)| p.weather.get(variable))
    }

    /// Values in `[hour − window, hour − 1]`
    fn window_before(&self, hour: DateTime<Utc>, window: i64) -> Vec<f64> {
        self.points
            .range((hour - Duration::hours(window))..hour)
            .map(|(_, p)| p.value)
            .collect()
    }
}

/// Named feature columns, in row order
pub fn feature_columns() -> Vec<String> {
    let mut columns: Vec<String> = [
        "hour",
        "day_of_week",
        "month",
        "day_of_year",
        "hour_sin",
        "hour_cos",
        "day_sin",
        "day_cos",
        "month_sin",
        "month_cos",
        "lat",
        "lon",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    for variable in WEATHER_FEATURES {
        columns.push(variable.as_str().to_string());
    }
    columns.push("weather_missing".to_string());

    for lag in LAGS {
        columns.push(format!("lag_{}", lag));
        columns.push(format!("lag_{}_missing", lag));
    }
    for window in MEAN_WINDOWS {
        columns.push(format!("rolling_mean_{}", window));
        columns.push(format!("rolling_mean_{}_missing", window));
    }
    for window in STD_WINDOWS {
        columns.push(format!("rolling_std_{}", window));
        columns.push(format!("rolling_std_{}_missing", window));
    }
    columns
}

fn flag(missing: bool) -> f64 {
    if missing {
        1.0
    } else {
        0.0
    }
}

/// Feature row for `target`, reading only history strictly before it
///
/// `weather` is the snapshot for the target hour itself: the record's own
/// weather in training, the carried-forward snapshot when forecasting.
pub fn build_row(
    series: &HourlySeries,
    target: DateTime<Utc>,
    weather: &WeatherSnapshot,
) -> Vec<f64> {
    let mut row = Vec::new();

    let hour = target.hour() as f64;
    let dow = target.weekday().num_days_from_monday() as f64;
    let month = target.month() as f64;
    row.extend_from_slice(&[
        hour,
        dow,
        month,
        target.ordinal() as f64,
        (TAU * hour / 24.0).sin(),
        (TAU * hour / 24.0).cos(),
        (TAU * dow / 7.0).sin(),
        (TAU * dow / 7.0).cos(),
        (TAU * (month - 1.0) / 12.0).sin(),
        (TAU * (month - 1.0) / 12.0).cos(),
        series.lat,
        series.lon,
    ]);

    let mut weather_missing = false;
    for variable in WEATHER_FEATURES {
        let value = match weather.get(variable) {
            Some(v) => v,
            None => {
                weather_missing = true;
                series.last_weather_before(target, variable).unwrap_or(MISSING)
            }
        };
        row.push(value);
    }
    row.push(flag(weather_missing));

    // Forward-fill source for windows with no values
    let last_known = series.last_value_at_or_before(target - Duration::hours(1));

    for lag in LAGS {
        let at = target - Duration::hours(lag);
        match series.get(at) {
            Some(p) => {
                row.push(p.value);
                row.push(flag(false));
            }
            None => {
                row.push(series.last_value_at_or_before(at).unwrap_or(MISSING));
                row.push(flag(true));
            }
        }
    }

    for window in MEAN_WINDOWS {
        let values = series.window_before(target, window);
        if values.is_empty() {
            row.push(last_known.unwrap_or(MISSING));
        } else {
            row.push(values.iter().sum::<f64>() / values.len() as f64);
        }
        row.push(flag((values.len() as i64) < window));
    }

    for window in STD_WINDOWS {
        let values = series.window_before(target, window);
        row.push(sample_std(&values).unwrap_or(MISSING));
        row.push(flag((values.len() as i64) < window));
    }

    row
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    Some((values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt())
}

/// Feature matrix with aligned targets
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
    pub timestamps: Vec<DateTime<Utc>>,
}

impl FeatureMatrix {
    pub fn empty() -> Self {
        Self {
            columns: feature_columns(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append another matrix built with the same columns
    pub fn extend(&mut self, other: FeatureMatrix) {
        self.rows.extend(other.rows);
        self.targets.extend(other.targets);
        self.timestamps.extend(other.timestamps);
    }

    /// Stable chronological ordering of rows
    pub fn sort_chronologically(&mut self) {
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        order.sort_by_key(|&i| self.timestamps[i]);
        let rows = std::mem::take(&mut self.rows);
        let mut slots: Vec<Option<Vec<f64>>> = rows.into_iter().map(Some).collect();
        self.rows = order.iter().filter_map(|&i| slots[i].take()).collect();
        self.targets = order.iter().map(|&i| self.targets[i]).collect();
        self.timestamps = order.iter().map(|&i| self.timestamps[i]).collect();
    }

    /// Split at `fraction` of rows: (head, tail)
    pub fn split(mut self, fraction: f64) -> (FeatureMatrix, FeatureMatrix) {
        let at = ((self.rows.len() as f64) * fraction).floor() as usize;
        let tail = FeatureMatrix {
            columns: self.columns.clone(),
            rows: self.rows.split_off(at),
            targets: self.targets.split_off(at),
            timestamps: self.timestamps.split_off(at),
        };
        (self, tail)
    }
}

/// One row per point of the series; the point's value is the target
pub fn build_training_matrix(series: &HourlySeries) -> FeatureMatrix {
    let mut matrix = FeatureMatrix::empty();
    for (hour, point) in series.iter() {
        if !point.value.is_finite() {
            continue;
        }
        matrix.rows.push(build_row(series, *hour, &point.weather));
        matrix.targets.push(point.value);
        matrix.timestamps.push(*hour);
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn h(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    fn column(name: &str) -> usize {
        feature_columns()
            .iter()
            .position(|c| c == name)
            .unwrap_or_else(|| panic!("no column {}", name))
    }

    fn series(values: &[(i64, f64)]) -> HourlySeries {
        let mut s = HourlySeries::new(34.1, -118.2);
        for (hour, value) in values {
            s.insert(h(*hour), *value, WeatherSnapshot::default());
        }
        s
    }

    #[test]
    fn test_row_width_matches_columns() {
        let s = series(&[(0, 1.0)]);
        let row = build_row(&s, h(1), &WeatherSnapshot::default());
        assert_eq!(row.len(), feature_columns().len());
    }

    #[test]
    fn test_lags_use_hour_offsets_and_flag_gaps() {
        // hour 8 is missing: lag_2 at hour 10 forward-fills from hour 7
        let s = series(&[(7, 70.0), (9, 90.0)]);
        let row = build_row(&s, h(10), &WeatherSnapshot::default());

        assert_eq!(row[column("lag_1")], 90.0);
        assert_eq!(row[column("lag_1_missing")], 0.0);
        assert_eq!(row[column("lag_2")], 70.0);
        assert_eq!(row[column("lag_2_missing")], 1.0);
        assert_eq!(row[column("lag_24")], 0.0);
        assert_eq!(row[column("lag_24_missing")], 1.0);
    }

    #[test]
    fn test_rolling_windows_exclude_target() {
        let s = series(&[(0, 1.0), (1, 2.0), (2, 3.0), (3, 1000.0)]);
        let row = build_row(&s, h(3), &WeatherSnapshot::default());

        assert_eq!(row[column("rolling_mean_3")], 2.0);
        assert_eq!(row[column("rolling_mean_3_missing")], 0.0);
        assert!((row[column("rolling_std_3")] - 1.0).abs() < 1e-12);
        assert_eq!(row[column("rolling_mean_6_missing")], 1.0);
    }

    #[test]
    fn test_empty_window_forward_fills_and_flags() {
        let s = series(&[(0, 5.0)]);
        let row = build_row(&s, h(10), &WeatherSnapshot::default());
        assert_eq!(row[column("rolling_mean_3")], 5.0);
        assert_eq!(row[column("rolling_mean_3_missing")], 1.0);
        assert_eq!(row[column("rolling_std_3")], 0.0);
        assert_eq!(row[column("rolling_std_3_missing")], 1.0);
    }

    #[test]
    fn test_weather_forward_fill_sets_indicator() {
        let mut s = series(&[]);
        let mut weather = WeatherSnapshot::default();
        weather.set(WeatherVariable::Temperature, 18.0);
        s.insert(h(0), 10.0, weather);

        let row = build_row(&s, h(1), &WeatherSnapshot::default());
        assert_eq!(row[column("temperature")], 18.0);
        assert_eq!(row[column("humidity")], 0.0);
        assert_eq!(row[column("weather_missing")], 1.0);
    }

    #[test]
    fn test_future_points_do_not_change_row() {
        let base = series(&[(0, 1.0), (1, 2.0), (2, 3.0)]);
        let mut with_future = base.clone();
        with_future.insert(h(3), 999.0, WeatherSnapshot::default());
        with_future.insert(h(4), 999.0, WeatherSnapshot::default());

        let w = WeatherSnapshot::default();
        assert_eq!(build_row(&base, h(3), &w), build_row(&with_future, h(3), &w));
    }

    #[test]
    fn test_training_matrix_and_split() {
        let s = series(&(0..10).map(|i| (i, i as f64)).collect::<Vec<_>>());
        let matrix = build_training_matrix(&s);
        assert_eq!(matrix.len(), 10);
        assert_eq!(matrix.targets[3], 3.0);

        let (train, test) = matrix.split(0.8);
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 2);
        assert!(train.timestamps.last().unwrap() < test.timestamps.first().unwrap());
    }

    #[test]
    fn test_truncate_after_origin() {
        let mut s = series(&[(0, 1.0), (1, 2.0), (2, 3.0)]);
        s.truncate_after(h(1));
        assert_eq!(s.last_hour(), Some(h(1)));
        assert_eq!(s.len(), 2);
    }
}
