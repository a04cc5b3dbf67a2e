//! Canonical units and the per-parameter conversion table
//!
//! Conversions are affine (`canonical = value × scale + offset`). Gas
//! factors convert ppb to µg/m³ at 25 °C and 1 atm.

use crate::error::{PipelineError, PipelineResult};
use crate::types::{Parameter, Pollutant, WeatherVariable};

/// µg/m³ per ppb at 25 °C, 1 atm (molecular weight / 24.45)
fn ppb_factor(pollutant: Pollutant) -> Option<f64> {
    match pollutant {
        Pollutant::No2 => Some(1.88),
        Pollutant::O3 => Some(1.96),
        Pollutant::Co => Some(1.145),
        Pollutant::So2 => Some(2.62),
        Pollutant::Hcho => Some(1.23),
        // Particulates have no molar mass
        Pollutant::Pm25 | Pollutant::Pm10 => None,
    }
}

/// Affine conversion into a canonical unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conversion {
    pub scale: f64,
    pub offset: f64,
}

impl Conversion {
    const IDENTITY: Conversion = Conversion {
        scale: 1.0,
        offset: 0.0,
    };

    fn scale(scale: f64) -> Self {
        Self { scale, offset: 0.0 }
    }

    pub fn apply(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }

    pub fn invert(&self, canonical: f64) -> f64 {
        (canonical - self.offset) / self.scale
    }
}

/// Canonical unit label for a parameter
pub fn canonical_unit(parameter: Parameter) -> &'static str {
    match parameter {
        Parameter::Pollutant(_) => "µg/m³",
        Parameter::Weather(WeatherVariable::Temperature) => "°C",
        Parameter::Weather(WeatherVariable::Humidity) => "%",
        Parameter::Weather(WeatherVariable::WindSpeed) => "m/s",
        Parameter::Weather(WeatherVariable::WindDirection) => "deg",
        Parameter::Weather(WeatherVariable::Pressure) => "hPa",
    }
}

/// Collapse provider spellings (`µg/m³`, `ug/m3`, `ugm3`, `°C`, `km/h`) to one key
pub fn normalize_unit(unit: &str) -> String {
    unit.trim()
        .chars()
        .filter_map(|c| match c {
            'µ' | 'μ' => Some('u'),
            '³' => Some('3'),
            '°' | '/' | ' ' | '_' => None,
            c => Some(c.to_ascii_lowercase()),
        })
        .collect()
}

/// Look up the conversion for a parameter in a provider unit
pub fn conversion(parameter: Parameter, unit: &str) -> Option<Conversion> {
    let unit = normalize_unit(unit);
    match parameter {
        Parameter::Pollutant(pollutant) => match unit.as_str() {
            "ugm3" | "microgramspercubicmeter" => Some(Conversion::IDENTITY),
            "mgm3" => Some(Conversion::scale(1000.0)),
            "ppb" => ppb_factor(pollutant).map(Conversion::scale),
            "ppm" => ppb_factor(pollutant).map(|f| Conversion::scale(f * 1000.0)),
            _ => None,
        },
        Parameter::Weather(variable) => weather_conversion(variable, &unit),
    }
}

fn weather_conversion(variable: WeatherVariable, unit: &str) -> Option<Conversion> {
    match variable {
        WeatherVariable::Temperature => match unit {
            "c" | "degc" | "celsius" => Some(Conversion::IDENTITY),
            "f" | "degf" | "fahrenheit" => Some(Conversion {
                scale: 5.0 / 9.0,
                offset: -32.0 * 5.0 / 9.0,
            }),
            "k" | "kelvin" => Some(Conversion {
                scale: 1.0,
                offset: -273.15,
            }),
            _ => None,
        },
        WeatherVariable::Humidity => match unit {
            "%" | "percent" | "pct" => Some(Conversion::IDENTITY),
            "fraction" => Some(Conversion::scale(100.0)),
            _ => None,
        },
        WeatherVariable::WindSpeed => match unit {
            "ms" | "mps" => Some(Conversion::IDENTITY),
            "kmh" | "kph" => Some(Conversion::scale(1.0 / 3.6)),
            "mph" => Some(Conversion::scale(0.44704)),
            "kn" | "knots" => Some(Conversion::scale(0.514444)),
            _ => None,
        },
        WeatherVariable::WindDirection => match unit {
            "deg" | "degrees" | "" => Some(Conversion::IDENTITY),
            _ => None,
        },
        WeatherVariable::Pressure => match unit {
            "hpa" | "mb" | "mbar" => Some(Conversion::IDENTITY),
            "kpa" => Some(Conversion::scale(10.0)),
            "pa" => Some(Conversion::scale(0.01)),
            "inhg" => Some(Conversion::scale(33.8639)),
            _ => None,
        },
    }
}

/// Convert a provider value to the canonical unit
pub fn to_canonical(parameter: Parameter, value: f64, unit: &str) -> PipelineResult<f64> {
    let conv = conversion(parameter, unit).ok_or_else(|| {
        PipelineError::Data(format!("Unrecognized unit '{}' for {}", unit, parameter))
    })?;
    Ok(conv.apply(value))
}

/// Convert a canonical value back to a provider unit
pub fn from_canonical(parameter: Parameter, canonical: f64, unit: &str) -> PipelineResult<f64> {
    let conv = conversion(parameter, unit).ok_or_else(|| {
        PipelineError::Data(format!("Unrecognized unit '{}' for {}", unit, parameter))
    })?;
    Ok(conv.invert(canonical))
}

/// Micrograms per cubic metre to ppb, for gases that have a factor
pub fn ugm3_to_ppb(pollutant: Pollutant, ugm3: f64) -> Option<f64> {
    ppb_factor(pollutant).map(|f| ugm3 / f)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO2: Parameter = Parameter::Pollutant(Pollutant::No2);
    const PM25: Parameter = Parameter::Pollutant(Pollutant::Pm25);
    const TEMP: Parameter = Parameter::Weather(WeatherVariable::Temperature);

    #[test]
    fn test_microgram_aliases_are_identity() {
        for unit in ["µg/m³", "ug/m3", "ugm3", "UG/M3", "μg/m³"] {
            assert_eq!(to_canonical(PM25, 12.5, unit).unwrap(), 12.5, "unit {}", unit);
        }
    }

    #[test]
    fn test_ppb_and_ppm_factors() {
        assert!((to_canonical(NO2, 10.0, "ppb").unwrap() - 18.8).abs() < 1e-9);
        assert!((to_canonical(NO2, 0.01, "ppm").unwrap() - 18.8).abs() < 1e-9);
        assert!(
            (to_canonical(Parameter::Pollutant(Pollutant::Co), 1.0, "mg/m³").unwrap() - 1000.0)
                .abs()
                < 1e-9
        );
    }

    #[test]
    fn test_particulates_reject_mixing_ratios() {
        assert!(to_canonical(PM25, 10.0, "ppb").is_err());
    }

    #[test]
    fn test_unknown_unit_is_data_error() {
        match to_canonical(NO2, 1.0, "furlongs") {
            Err(PipelineError::Data(msg)) => assert!(msg.contains("furlongs")),
            other => panic!("expected data error, got {:?}", other),
        }
    }

    #[test]
    fn test_temperature_scales() {
        assert!((to_canonical(TEMP, 212.0, "°F").unwrap() - 100.0).abs() < 1e-9);
        assert!((to_canonical(TEMP, 273.15, "K").unwrap()).abs() < 1e-9);
        assert_eq!(to_canonical(TEMP, 21.0, "°C").unwrap(), 21.0);
    }

    #[test]
    fn test_every_recognized_unit_round_trips() {
        let cases: &[(Parameter, &[&str])] = &[
            (NO2, &["ug/m3", "mg/m3", "ppb", "ppm"]),
            (PM25, &["ug/m3", "mg/m3"]),
            (TEMP, &["C", "F", "K"]),
            (Parameter::Weather(WeatherVariable::WindSpeed), &["m/s", "km/h", "mph", "knots"]),
            (Parameter::Weather(WeatherVariable::Pressure), &["hPa", "kPa", "Pa", "inHg"]),
        ];
        for (parameter, units) in cases {
            for unit in *units {
                for value in [0.0, 1.5, 42.0, 1013.25] {
                    let canonical = to_canonical(*parameter, value, unit).unwrap();
                    let back = from_canonical(*parameter, canonical, unit).unwrap();
                    assert!(
                        (back - value).abs() < 1e-9 * value.abs().max(1.0),
                        "{} {} -> {} -> {}",
                        parameter,
                        unit,
                        canonical,
                        back
                    );
                }
            }
        }
    }
}
