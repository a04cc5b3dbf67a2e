//! Quality report over a validated batch

use serde::Serialize;
use std::collections::BTreeMap;

use crate::types::{CanonicalRecord, ConfidenceBand, Pollutant};

/// Band counts and mean confidence for one pollutant
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollutantQuality {
    pub count: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub anomalies: usize,
    pub mean_confidence: f64,
}

/// Summary of a validated batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub total: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Records whose cross-source discrepancy exceeded the threshold
    pub high_discrepancy: usize,
    pub anomalies: usize,
    pub mean_confidence: f64,
    /// Mean over records that had ≥2 sources; `None` when there were none
    pub mean_discrepancy: Option<f64>,
    pub by_pollutant: BTreeMap<Pollutant, PollutantQuality>,
}

impl QualityReport {
    pub fn from_records(records: &[CanonicalRecord], discrepancy_threshold: f64) -> Self {
        let mut report = QualityReport {
            total: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            return report;
        }

        let mut confidence_sum = 0.0;
        let mut discrepancies = Vec::new();
        let mut pollutant_sums: BTreeMap<Pollutant, f64> = BTreeMap::new();

        for record in records {
            let entry = report.by_pollutant.entry(record.pollutant).or_default();
            entry.count += 1;
            match record.band {
                ConfidenceBand::High => {
                    report.high += 1;
                    entry.high += 1;
                }
                ConfidenceBand::Medium => {
                    report.medium += 1;
                    entry.medium += 1;
                }
                ConfidenceBand::Low => {
                    report.low += 1;
                    entry.low += 1;
                }
            }
            if record.anomaly {
                report.anomalies += 1;
                entry.anomalies += 1;
            }
            if let Some(d) = record.discrepancy {
                discrepancies.push(d);
                if d > discrepancy_threshold {
                    report.high_discrepancy += 1;
                }
            }
            confidence_sum += record.confidence;
            *pollutant_sums.entry(record.pollutant).or_default() += record.confidence;
        }

        report.mean_confidence = confidence_sum / records.len() as f64;
        if !discrepancies.is_empty() {
            report.mean_discrepancy =
                Some(discrepancies.iter().sum::<f64>() / discrepancies.len() as f64);
        }
        for (pollutant, sum) in pollutant_sums {
            if let Some(entry) = report.by_pollutant.get_mut(&pollutant) {
                entry.mean_confidence = sum / entry.count as f64;
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LocationBinId, WeatherSnapshot};
    use chrono::{TimeZone, Utc};

    fn record(
        pollutant: Pollutant,
        band: ConfidenceBand,
        confidence: f64,
        discrepancy: Option<f64>,
    ) -> CanonicalRecord {
        CanonicalRecord {
            location_bin_id: LocationBinId { lat_idx: 1, lon_idx: 2 },
            hour_bucket: Utc.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap(),
            pollutant,
            lat: 0.1,
            lon: 0.2,
            value: 10.0,
            contributing_sources: vec![],
            confidence,
            band,
            reason: None,
            discrepancy,
            anomaly: false,
            weather: WeatherSnapshot::default(),
        }
    }

    #[test]
    fn test_counts_and_means() {
        let records = vec![
            record(Pollutant::No2, ConfidenceBand::Low, 0.4, Some(0.375)),
            record(Pollutant::No2, ConfidenceBand::High, 0.9, Some(0.05)),
            record(Pollutant::Pm25, ConfidenceBand::Medium, 0.75, None),
        ];
        let report = QualityReport::from_records(&records, 0.30);

        assert_eq!(report.total, 3);
        assert_eq!((report.high, report.medium, report.low), (1, 1, 1));
        assert_eq!(report.high_discrepancy, 1);
        assert!((report.mean_confidence - (0.4 + 0.9 + 0.75) / 3.0).abs() < 1e-9);
        assert!((report.mean_discrepancy.unwrap() - 0.2125).abs() < 1e-9);

        let no2 = &report.by_pollutant[&Pollutant::No2];
        assert_eq!(no2.count, 2);
        assert!((no2.mean_confidence - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_empty_batch() {
        let report = QualityReport::from_records(&[], 0.30);
        assert_eq!(report.total, 0);
        assert!(report.mean_discrepancy.is_none());
        assert!(report.by_pollutant.is_empty());
    }

    #[test]
    fn test_serializes_pollutant_keys_by_name() {
        let records = vec![record(Pollutant::Pm25, ConfidenceBand::High, 0.9, None)];
        let json = serde_json::to_value(QualityReport::from_records(&records, 0.3)).unwrap();
        assert_eq!(json["by_pollutant"]["PM2.5"]["count"], 1);
    }
}
