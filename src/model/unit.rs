//! Units of measure grouped into conversion domains
//!
//! Every [`Unit`] belongs to exactly one [`UnitDomain`]. Conversion is only
//! defined between members of the same domain; anything else is an
//! [`Error::IncompatibleUnit`].
//!
//! Time and data size are linear domains: each unit carries a scale relative
//! to the smallest member (nanosecond, bit) and conversion multiplies by the
//! ratio of scales. Temperature is affine and is converted through kelvin.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Conversion domain of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitDomain {
    /// Durations, nanosecond through week
    Time,
    /// Data sizes, bit through petabyte
    DataSize,
    /// Temperatures (affine conversions)
    Temperature,
}

impl UnitDomain {
    /// All units in this domain, smallest first
    pub fn units(self) -> &'static [Unit] {
        match self {
            UnitDomain::Time => &TIME_UNITS,
            UnitDomain::DataSize => &DATA_SIZE_UNITS,
            UnitDomain::Temperature => &TEMPERATURE_UNITS,
        }
    }

    /// Smallest member of the domain
    pub fn smallest(self) -> Unit {
        self.units()[0]
    }

    /// Largest member of the domain
    pub fn largest(self) -> Unit {
        let units = self.units();
        units[units.len() - 1]
    }
}

/// Unit of measure attached to a [`Quantity`](super::Quantity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Unit {
    // Time
    /// Nanoseconds
    Nanosecond,
    /// Microseconds
    Microsecond,
    /// Milliseconds
    Millisecond,
    /// Seconds
    Second,
    /// Minutes
    Minute,
    /// Hours
    Hour,
    /// Days
    Day,
    /// Weeks
    Week,

    // Data size
    /// Bits
    Bit,
    /// Bytes (8 bits)
    Byte,
    /// Kilobits (1024 bits)
    Kilobit,
    /// Kilobytes (1000 bytes)
    Kilobyte,
    /// Megabits
    Megabit,
    /// Megabytes
    Megabyte,
    /// Gigabits
    Gigabit,
    /// Gigabytes
    Gigabyte,
    /// Terabits
    Terabit,
    /// Terabytes
    Terabyte,
    /// Petabits
    Petabit,
    /// Petabytes
    Petabyte,

    // Temperature
    /// Kelvin
    Kelvin,
    /// Degrees Celsius
    Celsius,
    /// Degrees Fahrenheit
    Fahrenheit,
}

const TIME_UNITS: [Unit; 8] = [
    Unit::Nanosecond,
    Unit::Microsecond,
    Unit::Millisecond,
    Unit::Second,
    Unit::Minute,
    Unit::Hour,
    Unit::Day,
    Unit::Week,
];

// Ordered by scale, not by name: a kilobit (1024 bits) is larger than a
// byte but smaller than a kilobyte (8000 bits).
const DATA_SIZE_UNITS: [Unit; 12] = [
    Unit::Bit,
    Unit::Byte,
    Unit::Kilobit,
    Unit::Kilobyte,
    Unit::Megabit,
    Unit::Megabyte,
    Unit::Gigabit,
    Unit::Gigabyte,
    Unit::Terabit,
    Unit::Terabyte,
    Unit::Petabit,
    Unit::Petabyte,
];

const TEMPERATURE_UNITS: [Unit; 3] = [Unit::Kelvin, Unit::Celsius, Unit::Fahrenheit];

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;
const BITS_PER_BYTE: f64 = 8.0;
const BINARY_STEP: f64 = 1024.0;
const DECIMAL_STEP: f64 = 1000.0;

impl Unit {
    /// Every supported unit
    pub const ALL: [Unit; 23] = [
        Unit::Nanosecond,
        Unit::Microsecond,
        Unit::Millisecond,
        Unit::Second,
        Unit::Minute,
        Unit::Hour,
        Unit::Day,
        Unit::Week,
        Unit::Bit,
        Unit::Byte,
        Unit::Kilobit,
        Unit::Kilobyte,
        Unit::Megabit,
        Unit::Megabyte,
        Unit::Gigabit,
        Unit::Gigabyte,
        Unit::Terabit,
        Unit::Terabyte,
        Unit::Petabit,
        Unit::Petabyte,
        Unit::Kelvin,
        Unit::Celsius,
        Unit::Fahrenheit,
    ];

    /// Domain this unit belongs to
    pub fn domain(self) -> UnitDomain {
        match self {
            Unit::Nanosecond
            | Unit::Microsecond
            | Unit::Millisecond
            | Unit::Second
            | Unit::Minute
            | Unit::Hour
            | Unit::Day
            | Unit::Week => UnitDomain::Time,
            Unit::Kelvin | Unit::Celsius | Unit::Fahrenheit => UnitDomain::Temperature,
            _ => UnitDomain::DataSize,
        }
    }

    /// Canonical upper-case name, as used on the wire and in logs
    pub fn name(self) -> &'static str {
        match self {
            Unit::Nanosecond => "NANOSECOND",
            Unit::Microsecond => "MICROSECOND",
            Unit::Millisecond => "MILLISECOND",
            Unit::Second => "SECOND",
            Unit::Minute => "MINUTE",
            Unit::Hour => "HOUR",
            Unit::Day => "DAY",
            Unit::Week => "WEEK",
            Unit::Bit => "BIT",
            Unit::Byte => "BYTE",
            Unit::Kilobit => "KILOBIT",
            Unit::Kilobyte => "KILOBYTE",
            Unit::Megabit => "MEGABIT",
            Unit::Megabyte => "MEGABYTE",
            Unit::Gigabit => "GIGABIT",
            Unit::Gigabyte => "GIGABYTE",
            Unit::Terabit => "TERABIT",
            Unit::Terabyte => "TERABYTE",
            Unit::Petabit => "PETABIT",
            Unit::Petabyte => "PETABYTE",
            Unit::Kelvin => "KELVIN",
            Unit::Celsius => "CELSIUS",
            Unit::Fahrenheit => "FAHRENHEIT",
        }
    }

    /// Position of the unit inside its domain's size ordering
    ///
    /// Linear units use their scale in the domain's base unit; temperature
    /// units use their declaration rank.
    fn scale(self) -> f64 {
        match self {
            Unit::Nanosecond => 1.0,
            Unit::Microsecond => 1_000.0,
            Unit::Millisecond => 1_000_000.0,
            Unit::Second => NANOS_PER_SECOND,
            Unit::Minute => NANOS_PER_SECOND * 60.0,
            Unit::Hour => NANOS_PER_SECOND * 3_600.0,
            Unit::Day => NANOS_PER_SECOND * 86_400.0,
            Unit::Week => NANOS_PER_SECOND * 604_800.0,
            Unit::Bit => 1.0,
            Unit::Byte => BITS_PER_BYTE,
            Unit::Kilobit => BINARY_STEP,
            Unit::Megabit => BINARY_STEP * BINARY_STEP,
            Unit::Gigabit => BINARY_STEP * BINARY_STEP * BINARY_STEP,
            Unit::Terabit => BINARY_STEP * BINARY_STEP * BINARY_STEP * BINARY_STEP,
            Unit::Petabit => BINARY_STEP * BINARY_STEP * BINARY_STEP * BINARY_STEP * BINARY_STEP,
            Unit::Kilobyte => DECIMAL_STEP * BITS_PER_BYTE,
            Unit::Megabyte => DECIMAL_STEP * DECIMAL_STEP * BITS_PER_BYTE,
            Unit::Gigabyte => DECIMAL_STEP * DECIMAL_STEP * DECIMAL_STEP * BITS_PER_BYTE,
            Unit::Terabyte => {
                DECIMAL_STEP * DECIMAL_STEP * DECIMAL_STEP * DECIMAL_STEP * BITS_PER_BYTE
            },
            Unit::Petabyte => {
                DECIMAL_STEP * DECIMAL_STEP * DECIMAL_STEP * DECIMAL_STEP * DECIMAL_STEP * BITS_PER_BYTE
            },
            Unit::Kelvin => 1.0,
            Unit::Celsius => 2.0,
            Unit::Fahrenheit => 3.0,
        }
    }

    /// Check whether two units share a domain
    pub fn is_compatible(self, other: Unit) -> bool {
        self.domain() == other.domain()
    }

    /// Check if this unit is strictly smaller than `other`
    ///
    /// # Errors
    ///
    /// Returns `IncompatibleUnit` when the units are in different domains.
    pub fn is_smaller_than(self, other: Unit) -> Result<bool> {
        self.ensure_compatible(other)?;
        Ok(self.scale() < other.scale())
    }

    /// Return the smaller of two units of the same domain
    pub fn smaller(self, other: Unit) -> Result<Unit> {
        Ok(if self.is_smaller_than(other)? { self } else { other })
    }

    /// Multiplicative factor turning a value in `self` into a value in `target`
    ///
    /// Only defined for linear domains; temperature conversions carry an
    /// offset and are reported as `UnsupportedOperation` unless the units
    /// are identical.
    pub fn conversion_factor(self, target: Unit) -> Result<f64> {
        self.ensure_compatible(target)?;
        if self == target {
            return Ok(1.0);
        }
        if self.domain() == UnitDomain::Temperature {
            return Err(Error::UnsupportedOperation(format!(
                "temperature conversion {} -> {} is not a pure scale",
                self, target
            )));
        }
        Ok(self.scale() / target.scale())
    }

    /// Convert `value` expressed in `self` into `target`
    pub fn convert(self, value: f64, target: Unit) -> Result<f64> {
        self.ensure_compatible(target)?;
        if self == target {
            return Ok(value);
        }
        match self.domain() {
            UnitDomain::Temperature => Ok(from_kelvin(to_kelvin(value, self), target)),
            _ => Ok(value * (self.scale() / target.scale())),
        }
    }

    fn ensure_compatible(self, other: Unit) -> Result<()> {
        if self.is_compatible(other) {
            Ok(())
        } else {
            Err(Error::incompatible(Some(self), Some(other)))
        }
    }
}

fn to_kelvin(value: f64, unit: Unit) -> f64 {
    match unit {
        Unit::Celsius => value + 273.15,
        Unit::Fahrenheit => (value + 459.67) * 5.0 / 9.0,
        _ => value,
    }
}

fn from_kelvin(kelvin: f64, unit: Unit) -> f64 {
    match unit {
        Unit::Celsius => kelvin - 273.15,
        Unit::Fahrenheit => kelvin * 9.0 / 5.0 - 459.67,
        _ => kelvin,
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Unit {
    type Err = Error;

    /// Parse a unit name case-insensitively (`"millisecond"`, `"SECOND"`)
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        // Older producers spell it this way
        if upper == "CELCIUS" {
            return Ok(Unit::Celsius);
        }
        Unit::ALL
            .iter()
            .copied()
            .find(|u| u.name() == upper)
            .ok_or_else(|| Error::Serialization(format!("unknown unit: {}", s)))
    }
}
