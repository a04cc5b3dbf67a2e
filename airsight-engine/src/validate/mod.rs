//! Cross-source validator
//!
//! Turns each `HarmonizedCandidate` into a confidence-tagged
//! `CanonicalRecord`. Records are never dropped: disagreement, single-source
//! coverage, suspect flags and trailing-window anomalies lower confidence
//! instead.
//!
//! **Scoring:**
//! - One source: `min(single_source_ceiling, weight)`
//! - Two or more: `min(dual_confirmed_ceiling, (1 − max_discrepancy) × (1 − Π(1 − wᵢ)))`
//! - `max_discrepancy` is taken over every pair of sources
//! - Discrepancy above threshold: band forced low, confidence capped at `low_band_cap`

pub mod report;

pub use report::{PollutantQuality, QualityReport};

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::ValidatorConfig;
use crate::types::{
    CanonicalRecord, ConfidenceBand, HarmonizedCandidate, LocationBinId, Pollutant, QualityFlag,
    SourceKind, SourceValue,
};

/// Validator
#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn discrepancy_threshold(&self) -> f64 {
        self.config.discrepancy_threshold
    }

    /// Reliability weight of one source's contribution
    pub fn source_weight(&self, source: &SourceValue) -> f64 {
        let base = match source.source.kind {
            SourceKind::Ground => self.config.ground_reliability,
            SourceKind::Satellite | SourceKind::Weather => self.config.satellite_reliability,
        };
        if source.quality == QualityFlag::Suspect {
            base * self.config.suspect_penalty
        } else {
            base
        }
    }

    /// `|a − b| / max(a, b, ε)`
    pub fn relative_discrepancy(&self, a: f64, b: f64) -> f64 {
        (a - b).abs() / a.max(b).max(self.config.epsilon)
    }

    pub fn band_for(&self, confidence: f64) -> ConfidenceBand {
        if confidence >= self.config.high_threshold {
            ConfidenceBand::High
        } else if confidence >= self.config.medium_threshold {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }

    /// Validate one candidate in isolation (no batch anomaly pass)
    pub fn validate(&self, candidate: &HarmonizedCandidate) -> CanonicalRecord {
        let contributing_sources: Vec<String> =
            candidate.sources.iter().map(|s| s.source.label()).collect();

        let (confidence, band, reason, discrepancy) = match candidate.sources.as_slice() {
            [] => (
                0.0,
                ConfidenceBand::Low,
                Some("No contributing sources".to_string()),
                None,
            ),
            [only] => {
                let confidence = self
                    .source_weight(only)
                    .min(self.config.single_source_ceiling)
                    .clamp(0.0, 1.0);
                (confidence, self.band_for(confidence), None, None)
            }
            sources => self.score_multi_source(sources),
        };

        if band == ConfidenceBand::Low {
            debug!(
                pollutant = %candidate.key.pollutant,
                bin = %candidate.key.location_bin_id,
                confidence,
                reason = reason.as_deref().unwrap_or(""),
                "Low-confidence record"
            );
        }

        CanonicalRecord {
            location_bin_id: candidate.key.location_bin_id,
            hour_bucket: candidate.key.hour_bucket,
            pollutant: candidate.key.pollutant,
            lat: candidate.lat,
            lon: candidate.lon,
            value: candidate.value,
            contributing_sources,
            confidence,
            band,
            reason,
            discrepancy,
            anomaly: false,
            weather: candidate.weather.clone(),
        }
    }

    /// Largest relative discrepancy over every pair of sources
    pub fn max_pairwise_discrepancy(&self, sources: &[SourceValue]) -> f64 {
        sources
            .iter()
            .enumerate()
            .flat_map(|(i, a)| {
                sources[i + 1..]
                    .iter()
                    .map(move |b| self.relative_discrepancy(a.value, b.value))
            })
            .fold(0.0_f64, f64::max)
    }

    fn score_multi_source(
        &self,
        sources: &[SourceValue],
    ) -> (f64, ConfidenceBand, Option<String>, Option<f64>) {
        let max_discrepancy = self.max_pairwise_discrepancy(sources);

        let combined_reliability =
            1.0 - sources.iter().map(|s| 1.0 - self.source_weight(s)).product::<f64>();
        let agreement = (1.0 - max_discrepancy).max(0.0);
        let confidence = (agreement * combined_reliability)
            .min(self.config.dual_confirmed_ceiling)
            .clamp(0.0, 1.0);

        if max_discrepancy > self.config.discrepancy_threshold {
            let reason = format!(
                "Cross-source discrepancy {:.1}% exceeds {:.1}% threshold",
                max_discrepancy * 100.0,
                self.config.discrepancy_threshold * 100.0
            );
            (
                confidence.min(self.config.low_band_cap),
                ConfidenceBand::Low,
                Some(reason),
                Some(max_discrepancy),
            )
        } else {
            (
                confidence,
                self.band_for(confidence),
                None,
                Some(max_discrepancy),
            )
        }
    }

    /// Validate a batch with no stored history for anomaly context
    pub fn validate_batch(&self, candidates: &[HarmonizedCandidate]) -> Vec<CanonicalRecord> {
        self.validate_batch_with_history(candidates, &[])
    }

    /// Validate a batch, then flag z-score anomalies per (bin, pollutant)
    ///
    /// Each record is scored against the values in the
    /// `anomaly_window_hours` before its own hour, drawn from `history` and
    /// the batch itself (the batch wins on the same key). A record's result
    /// depends only on its bin's trailing series, not on what else shares
    /// the batch. Anomalous records are demoted one band, never dropped.
    pub fn validate_batch_with_history(
        &self,
        candidates: &[HarmonizedCandidate],
        history: &[CanonicalRecord],
    ) -> Vec<CanonicalRecord> {
        let mut records: Vec<CanonicalRecord> =
            candidates.iter().map(|c| self.validate(c)).collect();
        self.flag_anomalies(&mut records, history);
        records
    }

    fn flag_anomalies(&self, records: &mut [CanonicalRecord], history: &[CanonicalRecord]) {
        let mut series: BTreeMap<(LocationBinId, Pollutant), BTreeMap<DateTime<Utc>, f64>> =
            BTreeMap::new();
        for record in history.iter().chain(records.iter()) {
            series
                .entry((record.location_bin_id, record.pollutant))
                .or_default()
                .insert(record.hour_bucket, record.value);
        }

        let window = Duration::hours(self.config.anomaly_window_hours);
        for record in records.iter_mut() {
            let Some(points) = series.get(&(record.location_bin_id, record.pollutant)) else {
                continue;
            };
            let trailing: Vec<f64> = points
                .range((record.hour_bucket - window)..record.hour_bucket)
                .map(|(_, v)| *v)
                .collect();
            if trailing.len() < self.config.anomaly_min_samples {
                continue;
            }

            let n = trailing.len() as f64;
            let mean = trailing.iter().sum::<f64>() / n;
            let std = (trailing.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            if std <= 0.0 {
                continue;
            }
            let z = (record.value - mean) / std;
            if z.abs() <= self.config.anomaly_z_threshold {
                continue;
            }

            record.anomaly = true;
            record.band = record.band.demoted();
            record.confidence = record.confidence.min(self.band_cap(record.band));
            let note = format!(
                "Statistical anomaly against trailing {}h (z = {:.2})",
                self.config.anomaly_window_hours, z
            );
            record.reason = Some(match record.reason.take() {
                Some(existing) => format!("{}; {}", existing, note),
                None => note,
            });
        }
    }

    /// Highest confidence a demoted record may keep
    fn band_cap(&self, band: ConfidenceBand) -> f64 {
        match band {
            ConfidenceBand::High => 1.0,
            ConfidenceBand::Medium => {
                (self.config.medium_threshold + self.config.high_threshold) / 2.0
            }
            ConfidenceBand::Low => self.config.low_band_cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LocationBinId, RecordKey, SourceInfo, WeatherSnapshot};
    use chrono::{TimeZone, Utc};

    fn source(kind: SourceKind, provider: &str, value: f64) -> SourceValue {
        SourceValue {
            source: SourceInfo::new(kind, provider),
            value,
            reading_count: 1,
            quality: QualityFlag::Good,
        }
    }

    fn candidate(pollutant: Pollutant, value: f64, sources: Vec<SourceValue>) -> HarmonizedCandidate {
        HarmonizedCandidate {
            key: RecordKey {
                location_bin_id: LocationBinId { lat_idx: 341, lon_idx: -1182 },
                hour_bucket: Utc.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap(),
                pollutant,
            },
            lat: 34.1,
            lon: -118.2,
            value,
            sources,
            weather: WeatherSnapshot::default(),
        }
    }

    fn validator() -> Validator {
        Validator::new(&ValidatorConfig::default())
    }

    #[test]
    fn test_large_discrepancy_is_low() {
        // satellite 50 vs ground 80: 30 / 80 = 37.5%
        let c = candidate(
            Pollutant::No2,
            80.0,
            vec![
                source(SourceKind::Ground, "OpenAQ", 80.0),
                source(SourceKind::Satellite, "TEMPO", 50.0),
            ],
        );
        let record = validator().validate(&c);

        assert_eq!(record.band, ConfidenceBand::Low);
        assert!(record.confidence <= 0.5);
        assert!((record.discrepancy.unwrap() - 0.375).abs() < 1e-9);
        assert!(record.reason.unwrap().contains("37.5%"));
        assert_eq!(record.contributing_sources, vec!["ground:OpenAQ", "satellite:TEMPO"]);
    }

    #[test]
    fn test_disagreeing_ground_providers_are_low() {
        // ground mean 65 sits within 30% of both, the pair itself does not
        let c = candidate(
            Pollutant::No2,
            65.0,
            vec![
                source(SourceKind::Ground, "AirNow", 50.0),
                source(SourceKind::Ground, "OpenAQ", 80.0),
                source(SourceKind::Satellite, "TEMPO", 65.0),
            ],
        );
        let record = validator().validate(&c);

        assert_eq!(record.band, ConfidenceBand::Low);
        assert!(record.confidence <= 0.5);
        assert!((record.discrepancy.unwrap() - 0.375).abs() < 1e-9);
    }

    #[test]
    fn test_agreeing_sources_are_high() {
        let c = candidate(
            Pollutant::No2,
            40.0,
            vec![
                source(SourceKind::Ground, "OpenAQ", 40.0),
                source(SourceKind::Satellite, "TEMPO", 38.0),
            ],
        );
        let record = validator().validate(&c);
        assert_eq!(record.band, ConfidenceBand::High);
        assert!(record.confidence <= 0.95);
        assert!(record.reason.is_none());
    }

    #[test]
    fn test_single_source_is_capped_below_dual() {
        let single = validator().validate(&candidate(
            Pollutant::Pm25,
            12.0,
            vec![source(SourceKind::Ground, "OpenAQ", 12.0)],
        ));
        let dual = validator().validate(&candidate(
            Pollutant::Pm25,
            12.0,
            vec![
                source(SourceKind::Ground, "OpenAQ", 12.0),
                source(SourceKind::Satellite, "TEMPO", 12.0),
            ],
        ));
        assert_eq!(single.confidence, 0.75);
        assert_eq!(single.band, ConfidenceBand::Medium);
        assert!(dual.confidence > single.confidence);
        assert!(single.discrepancy.is_none());
    }

    #[test]
    fn test_suspect_flag_lowers_weight() {
        let v = validator();
        let mut suspect = source(SourceKind::Satellite, "TEMPO", 10.0);
        suspect.quality = QualityFlag::Suspect;
        let clean = source(SourceKind::Satellite, "TEMPO", 10.0);
        assert!(v.source_weight(&suspect) < v.source_weight(&clean));

        let record = v.validate(&candidate(Pollutant::O3, 10.0, vec![suspect]));
        assert!((record.confidence - 0.64).abs() < 1e-9);
    }

    #[test]
    fn test_zero_values_do_not_divide_by_zero() {
        let record = validator().validate(&candidate(
            Pollutant::Co,
            0.0,
            vec![
                source(SourceKind::Ground, "OpenAQ", 0.0),
                source(SourceKind::Satellite, "TEMPO", 0.0),
            ],
        ));
        assert_eq!(record.discrepancy, Some(0.0));
        assert!(record.confidence.is_finite());
    }

    fn hourly(value: f64, hour: i64) -> HarmonizedCandidate {
        let mut c = candidate(
            Pollutant::Pm25,
            value,
            vec![
                source(SourceKind::Ground, "OpenAQ", value),
                source(SourceKind::Satellite, "TEMPO", value),
            ],
        );
        c.key.hour_bucket = c.key.hour_bucket + Duration::hours(hour);
        c
    }

    fn steady_day_then_spike() -> Vec<HarmonizedCandidate> {
        let mut batch: Vec<HarmonizedCandidate> =
            (0..20).map(|i| hourly(10.0 + (i % 3) as f64, i)).collect();
        batch.push(hourly(400.0, 20));
        batch
    }

    #[test]
    fn test_spike_is_demoted_not_dropped() {
        let records = validator().validate_batch(&steady_day_then_spike());
        assert_eq!(records.len(), 21);

        let outlier = &records[20];
        assert!(outlier.anomaly);
        assert_eq!(outlier.band, ConfidenceBand::Medium);
        assert!(outlier.confidence < 0.8);
        assert!(outlier.reason.as_ref().unwrap().contains("anomaly"));
        assert!(records[..20].iter().all(|r| !r.anomaly));
    }

    #[test]
    fn test_anomaly_does_not_depend_on_batch_composition() {
        let v = validator();
        let batch = steady_day_then_spike();
        let full = v.validate_batch(&batch);

        // Revalidating only the last hour against what is already stored
        let alone = v.validate_batch_with_history(&batch[20..], &full[..20]);
        assert_eq!(alone[0], full[20]);

        // Steady hour revalidated next to the spike stays clean
        let pair = v.validate_batch_with_history(&batch[19..], &full[..19]);
        assert_eq!(pair[0], full[19]);
        assert!(!pair[0].anomaly);
    }

    #[test]
    fn test_short_or_other_bin_history_is_not_scored() {
        let v = validator();
        let batch = steady_day_then_spike();

        // Only four trailing hours: below the sample minimum
        let records = v.validate_batch(&batch[16..]);
        assert!(records.iter().all(|r| !r.anomaly));

        // Same values in a neighbouring bin give no context
        let mut elsewhere = batch[20].clone();
        elsewhere.key.location_bin_id.lat_idx += 1;
        let history = v.validate_batch(&batch[..20]);
        let record = &v.validate_batch_with_history(&[elsewhere], &history)[0];
        assert!(!record.anomaly);
    }
}
