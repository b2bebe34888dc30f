//! Unit conversion between simulator units and device display units
//!
//! Every supported unit maps affinely onto the base unit of its quantity
//! family (`base = value * scale + offset`). Conversions only happen inside a
//! family; power, energy and dimensionless quantities are pass-through.

use std::fmt;
use std::str::FromStr;

use errors::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};

/// Pascals per inch of water column (conventional 4 °C definition)
const PA_PER_IN_H2O: f64 = 249.082;

/// Cubic metres per second in one cubic foot per minute
const M3S_PER_CFM: f64 = 4.719_474_432e-4;

/// Unit system the devices display values in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitSystem {
    #[default]
    #[serde(rename = "SI", alias = "si", alias = "Si")]
    Si,
    #[serde(rename = "US", alias = "us", alias = "Us", alias = "IP")]
    Us,
}

/// Physical quantity family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Temperature,
    Pressure,
    VolumetricFlow,
    Power,
    Energy,
    Concentration,
    Dimensionless,
}

/// Supported unit tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Kelvin,
    Celsius,
    Fahrenheit,
    Pascal,
    InchWaterColumn,
    CubicMeterPerSecond,
    CubicFootPerMinute,
    Watt,
    Joule,
    PartsPerMillion,
    Dimensionless,
    Percent,
}

impl Unit {
    pub const ALL: [Unit; 12] = [
        Unit::Kelvin,
        Unit::Celsius,
        Unit::Fahrenheit,
        Unit::Pascal,
        Unit::InchWaterColumn,
        Unit::CubicMeterPerSecond,
        Unit::CubicFootPerMinute,
        Unit::Watt,
        Unit::Joule,
        Unit::PartsPerMillion,
        Unit::Dimensionless,
        Unit::Percent,
    ];

    pub fn quantity(self) -> Quantity {
        match self {
            Unit::Kelvin | Unit::Celsius | Unit::Fahrenheit => Quantity::Temperature,
            Unit::Pascal | Unit::InchWaterColumn => Quantity::Pressure,
            Unit::CubicMeterPerSecond | Unit::CubicFootPerMinute => Quantity::VolumetricFlow,
            Unit::Watt => Quantity::Power,
            Unit::Joule => Quantity::Energy,
            Unit::PartsPerMillion => Quantity::Concentration,
            Unit::Dimensionless | Unit::Percent => Quantity::Dimensionless,
        }
    }

    /// (scale, offset) onto the family's base unit
    fn affine(self) -> (f64, f64) {
        match self {
            Unit::Celsius => (1.0, 273.15),
            Unit::Fahrenheit => (5.0 / 9.0, 273.15 - 32.0 * 5.0 / 9.0),
            Unit::InchWaterColumn => (PA_PER_IN_H2O, 0.0),
            Unit::CubicFootPerMinute => (M3S_PER_CFM, 0.0),
            // Base units and pass-through families
            Unit::Kelvin
            | Unit::Pascal
            | Unit::CubicMeterPerSecond
            | Unit::Watt
            | Unit::Joule
            | Unit::PartsPerMillion
            | Unit::Dimensionless
            | Unit::Percent => (1.0, 0.0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Unit::Kelvin => "K",
            Unit::Celsius => "degC",
            Unit::Fahrenheit => "degF",
            Unit::Pascal => "Pa",
            Unit::InchWaterColumn => "inH2O",
            Unit::CubicMeterPerSecond => "m3/s",
            Unit::CubicFootPerMinute => "ft3/min",
            Unit::Watt => "W",
            Unit::Joule => "J",
            Unit::PartsPerMillion => "ppm",
            Unit::Dimensionless => "1",
            Unit::Percent => "%",
        }
    }

    /// Convert `value` expressed in `self` into `to`
    pub fn convert(self, value: f64, to: Unit) -> SyncResult<f64> {
        if self == to {
            return Ok(value);
        }
        if self.quantity() != to.quantity() {
            return Err(SyncError::IncompatibleUnits {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let (from_scale, from_offset) = self.affine();
        let (to_scale, to_offset) = to.affine();
        let base = value * from_scale + from_offset;
        Ok((base - to_offset) / to_scale)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Unit {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        // Case matters only for the single-letter tags
        let unit = match tag {
            "K" => Unit::Kelvin,
            "C" => Unit::Celsius,
            "F" => Unit::Fahrenheit,
            "W" => Unit::Watt,
            "J" => Unit::Joule,
            "1" | "" => Unit::Dimensionless,
            "%" => Unit::Percent,
            _ => match tag.to_ascii_lowercase().as_str() {
                "kelvin" => Unit::Kelvin,
                "degc" | "°c" | "celsius" | "degree_celsius" => Unit::Celsius,
                "degf" | "°f" | "fahrenheit" | "degree_fahrenheit" => Unit::Fahrenheit,
                "pa" | "pascal" => Unit::Pascal,
                "inh2o" | "in_h2o" | "inch_h2o_39f" | "inwc" | "in_wc" => Unit::InchWaterColumn,
                "m3/s" | "m^3/s" | "m³/s" => Unit::CubicMeterPerSecond,
                "ft3/min" | "ft^3/min" | "cfm" => Unit::CubicFootPerMinute,
                "watt" => Unit::Watt,
                "joule" => Unit::Joule,
                "ppm" => Unit::PartsPerMillion,
                "dimensionless" | "-" => Unit::Dimensionless,
                "percent" => Unit::Percent,
                _ => return Err(SyncError::UnsupportedUnit(tag.to_string())),
            },
        };
        Ok(unit)
    }
}

/// Convert between two unit tags
///
/// Identical tags short-circuit to the input value; an unknown tag fails with
/// [`SyncError::UnsupportedUnit`], a cross-family pair with
/// [`SyncError::IncompatibleUnits`].
pub fn convert(value: f64, from: &str, to: &str) -> SyncResult<f64> {
    if from.trim() == to.trim() {
        // Still reject tags nobody understands
        from.parse::<Unit>()?;
        return Ok(value);
    }
    let from: Unit = from.parse()?;
    let to: Unit = to.parse()?;
    from.convert(value, to)
}

/// Check at construction time that `from -> to` is a conversion we can do
pub fn check_convertible(from: &str, to: &str) -> SyncResult<()> {
    convert(0.0, from, to).map(|_| ())
}
