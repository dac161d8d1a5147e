//! Numeric value tagged with an optional unit

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::unit::Unit;
use crate::error::{Error, Result};

/// Immutable (value, optional unit) pair
///
/// Equality is structural: `1 SECOND` and `1000 MILLISECOND` are different
/// quantities even though they compare as equal through [`Quantity::compare`].
/// A unit-less quantity is never equal to a unit'd one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quantity {
    value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<Unit>,
}

impl Quantity {
    /// Create a quantity
    pub fn new(value: f64, unit: Option<Unit>) -> Self {
        Self { value, unit }
    }

    /// Create a unit-less quantity
    pub fn unitless(value: f64) -> Self {
        Self { value, unit: None }
    }

    /// Create a quantity in `unit`
    pub fn with_unit(value: f64, unit: Unit) -> Self {
        Self {
            value,
            unit: Some(unit),
        }
    }

    /// Numeric value
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Unit, if any
    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }

    /// Whether the value is finite (not NaN or infinite)
    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
    }

    /// Return a new quantity expressed in `target`
    ///
    /// A unit-less quantity is returned unchanged: it is compatible with any
    /// unit but never acquires one implicitly.
    ///
    /// # Errors
    ///
    /// Returns `IncompatibleUnit` when the current unit is in a different
    /// domain than `target`.
    pub fn convert_to(&self, target: Unit) -> Result<Quantity> {
        match self.unit {
            None => Ok(*self),
            Some(unit) => Ok(Quantity::with_unit(unit.convert(self.value, target)?, target)),
        }
    }

    /// Order two quantities
    ///
    /// Unit-less quantities compare by value. Quantities in the same domain
    /// are converted to the smaller of the two units first.
    ///
    /// # Errors
    ///
    /// Returns `IncompatibleUnit` across domains or when exactly one side has
    /// a unit.
    pub fn compare(&self, other: &Quantity) -> Result<Ordering> {
        match (self.unit, other.unit) {
            (None, None) => Ok(self.value.total_cmp(&other.value)),
            (Some(a), Some(b)) if a == b => Ok(self.value.total_cmp(&other.value)),
            (Some(a), Some(b)) => {
                let common = a.smaller(b)?;
                let lhs = a.convert(self.value, common)?;
                let rhs = b.convert(other.value, common)?;
                Ok(lhs.total_cmp(&rhs))
            },
            (a, b) => Err(Error::incompatible(a, b)),
        }
    }

    /// Smallest unit shared by a set of quantities
    ///
    /// Returns `Ok(None)` when every quantity is unit-less (or the slice is
    /// empty). Mixing unit'd and unit-less quantities, or units of different
    /// domains, is an error.
    pub fn common_unit(quantities: &[Quantity]) -> Result<Option<Unit>> {
        let mut iter = quantities.iter();
        let first = match iter.next() {
            Some(q) => q.unit,
            None => return Ok(None),
        };
        let mut smallest = first;
        for q in iter {
            smallest = match (smallest, q.unit) {
                (None, None) => None,
                (Some(a), Some(b)) => Some(a.smaller(b)?),
                (a, b) => return Err(Error::incompatible(a, b)),
            };
        }
        Ok(smallest)
    }

    /// Express every quantity in the smallest unit present
    pub fn unify(quantities: &[Quantity]) -> Result<Vec<Quantity>> {
        match Self::common_unit(quantities)? {
            None => Ok(quantities.to_vec()),
            Some(unit) => quantities.iter().map(|q| q.convert_to(unit)).collect(),
        }
    }

    // -0.0 and 0.0 must hash alike since they compare equal
    fn value_key(&self) -> u64 {
        if self.value == 0.0 {
            0
        } else {
            self.value.to_bits()
        }
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.unit == other.unit && self.value_key() == other.value_key()
    }
}

impl Eq for Quantity {}

impl Hash for Quantity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value_key().hash(state);
        self.unit.hash(state);
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{} {}", self.value, unit),
            None => write!(f, "{}", self.value),
        }
    }
}
