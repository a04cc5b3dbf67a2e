//! EPA Air Quality Index sub-indices
//!
//! Breakpoints are in the EPA reporting units: µg/m³ for particulates, ppb
//! for O3 and NO2. Gas concentrations are converted from µg/m³ first.

use serde::{Deserialize, Serialize};

use super::units::ugm3_to_ppb;
use crate::types::Pollutant;

/// (c_low, c_high, i_low, i_high)
type Breakpoint = (f64, f64, f64, f64);

const PM25: &[Breakpoint] = &[
    (0.0, 12.0, 0.0, 50.0),
    (12.1, 35.4, 51.0, 100.0),
    (35.5, 55.4, 101.0, 150.0),
    (55.5, 150.4, 151.0, 200.0),
    (150.5, 250.4, 201.0, 300.0),
    (250.5, 500.4, 301.0, 500.0),
];

const PM10: &[Breakpoint] = &[
    (0.0, 54.0, 0.0, 50.0),
    (55.0, 154.0, 51.0, 100.0),
    (155.0, 254.0, 101.0, 150.0),
    (255.0, 354.0, 151.0, 200.0),
    (355.0, 424.0, 201.0, 300.0),
    (425.0, 604.0, 301.0, 500.0),
];

const O3: &[Breakpoint] = &[
    (0.0, 54.0, 0.0, 50.0),
    (55.0, 70.0, 51.0, 100.0),
    (71.0, 85.0, 101.0, 150.0),
    (86.0, 105.0, 151.0, 200.0),
    (106.0, 200.0, 201.0, 300.0),
];

const NO2: &[Breakpoint] = &[
    (0.0, 53.0, 0.0, 50.0),
    (54.0, 100.0, 51.0, 100.0),
    (101.0, 360.0, 101.0, 150.0),
    (361.0, 649.0, 151.0, 200.0),
    (650.0, 1249.0, 201.0, 300.0),
    (1250.0, 2049.0, 301.0, 500.0),
];

/// AQI category names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AqiCategory {
    #[serde(rename = "Good")]
    Good,
    #[serde(rename = "Moderate")]
    Moderate,
    #[serde(rename = "Unhealthy for Sensitive Groups")]
    UnhealthyForSensitiveGroups,
    #[serde(rename = "Unhealthy")]
    Unhealthy,
    #[serde(rename = "Very Unhealthy")]
    VeryUnhealthy,
    #[serde(rename = "Hazardous")]
    Hazardous,
}

impl AqiCategory {
    fn for_index(aqi: u32) -> Self {
        match aqi {
            0..=50 => AqiCategory::Good,
            51..=100 => AqiCategory::Moderate,
            101..=150 => AqiCategory::UnhealthyForSensitiveGroups,
            151..=200 => AqiCategory::Unhealthy,
            201..=300 => AqiCategory::VeryUnhealthy,
            _ => AqiCategory::Hazardous,
        }
    }
}

/// A pollutant sub-index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aqi {
    pub value: u32,
    pub category: AqiCategory,
}

fn breakpoints(pollutant: Pollutant) -> Option<&'static [Breakpoint]> {
    match pollutant {
        Pollutant::Pm25 => Some(PM25),
        Pollutant::Pm10 => Some(PM10),
        Pollutant::O3 => Some(O3),
        Pollutant::No2 => Some(NO2),
        _ => None,
    }
}

/// Sub-index for a concentration in µg/m³
///
/// Returns `None` for pollutants without a breakpoint table or for
/// non-finite/negative input. Concentrations above the table cap at 500.
pub fn compute(pollutant: Pollutant, ugm3: f64) -> Option<Aqi> {
    let table = breakpoints(pollutant)?;
    if !ugm3.is_finite() || ugm3 < 0.0 {
        return None;
    }

    let concentration = match pollutant {
        Pollutant::O3 | Pollutant::No2 => ugm3_to_ppb(pollutant, ugm3)?,
        _ => ugm3,
    };

    // Values that fall in the rounding gap between two rows use the upper row
    let value = match table.iter().find(|(_, c_high, _, _)| concentration <= *c_high) {
        Some(&(c_low, c_high, i_low, i_high)) => {
            let c = concentration.max(c_low);
            ((i_high - i_low) / (c_high - c_low) * (c - c_low) + i_low).round() as u32
        }
        None => 500,
    };

    Some(Aqi {
        value,
        category: AqiCategory::for_index(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pm25_breakpoints() {
        assert_eq!(compute(Pollutant::Pm25, 0.0).unwrap().value, 0);
        assert_eq!(compute(Pollutant::Pm25, 12.0).unwrap().value, 50);
        let moderate = compute(Pollutant::Pm25, 35.4).unwrap();
        assert_eq!(moderate.value, 100);
        assert_eq!(moderate.category, AqiCategory::Moderate);
    }

    #[test]
    fn test_gap_between_rows_uses_upper_row() {
        let aqi = compute(Pollutant::Pm25, 12.05).unwrap();
        assert_eq!(aqi.value, 51);
    }

    #[test]
    fn test_above_table_is_hazardous() {
        let aqi = compute(Pollutant::Pm10, 900.0).unwrap();
        assert_eq!(aqi.value, 500);
        assert_eq!(aqi.category, AqiCategory::Hazardous);
    }

    #[test]
    fn test_gases_are_indexed_in_ppb() {
        // 150.4 µg/m³ NO2 is 80 ppb, inside the Moderate row
        let aqi = compute(Pollutant::No2, 150.4).unwrap();
        assert_eq!(aqi.value, 79);
        assert_eq!(aqi.category, AqiCategory::Moderate);
    }

    #[test]
    fn test_unsupported_and_invalid_inputs() {
        assert!(compute(Pollutant::Co, 10.0).is_none());
        assert!(compute(Pollutant::Pm25, -1.0).is_none());
        assert!(compute(Pollutant::Pm25, f64::NAN).is_none());
    }

    #[test]
    fn test_category_serializes_as_epa_name() {
        let json = serde_json::to_string(&AqiCategory::UnhealthyForSensitiveGroups).unwrap();
        assert_eq!(json, "\"Unhealthy for Sensitive Groups\"");
    }
}
