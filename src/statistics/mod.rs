//! Statistic framework
//!
//! A [`Statistic`] is a stateless reduction from an ordered slice of
//! [`Quantity`] samples to a single [`CalculatedValue`]. The set of
//! statistics is closed: every supported algorithm is a variant of the enum
//! and is registered by name in the [`StatisticFactory`].
//!
//! ```text
//!   specified {mean, tp99}
//!        │ resolve
//!        ▼
//!   StatisticSelection ── dependent {sum, count, histogram}
//!        │ evaluation_order()
//!        ▼
//!   sum, count, histogram, mean, tp99   (dependencies first)
//! ```
//!
//! Statistics come in two flavours for the cluster tier: `Histogram` is
//! mergeable through its supporting data, everything else is combined by a
//! per-statistic reducer over the per-host scalar values ([`Statistic::reduce`]).

mod calculated;
mod factory;
pub mod histogram;
mod selection;

pub use calculated::CalculatedValue;
pub use factory::StatisticFactory;
pub use histogram::{Histogram, HistogramSupportingData, DEFAULT_PRECISION_BITS};
pub use selection::{StatisticSelection, StatisticsConfig};

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::model::{Quantity, Unit};

/// Percentile resolution: tenths of a percent
const TENTHS_PER_HUNDRED: u64 = 1000;

/// Supported statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Statistic {
    /// Number of samples
    Count,
    /// Sum of sample values
    Sum,
    /// Arithmetic mean
    Mean,
    /// Smallest sample (0th percentile)
    Min,
    /// Largest sample (100th percentile)
    Max,
    /// Nearest-rank percentile, in tenths of a percent (exclusive of 0 and 1000)
    Percentile(u16),
    /// Sparse histogram of sample values
    Histogram,
}

const NO_DEPENDENCIES: [Statistic; 0] = [];
const MEAN_DEPENDENCIES: [Statistic; 2] = [Statistic::Sum, Statistic::Count];
const PERCENTILE_DEPENDENCIES: [Statistic; 1] = [Statistic::Histogram];

impl Statistic {
    /// The median (50th percentile)
    pub const MEDIAN: Statistic = Statistic::Percentile(500);

    /// Percentile statistic for `percentile` in `[0, 100]`
    ///
    /// `0` maps to [`Statistic::Min`] and `100` to [`Statistic::Max`]. Only
    /// one decimal digit is supported.
    ///
    /// # Errors
    ///
    /// `UnknownStatistic` when out of range or finer than a tenth.
    pub fn percentile(percentile: f64) -> Result<Statistic> {
        let tenths = percentile * 10.0;
        let rounded = tenths.round();
        if !(0.0..=TENTHS_PER_HUNDRED as f64).contains(&rounded) || (tenths - rounded).abs() > 1e-6 {
            return Err(Error::UnknownStatistic(format!("percentile {}", percentile)));
        }
        Ok(match rounded as u16 {
            0 => Statistic::Min,
            1000 => Statistic::Max,
            t => Statistic::Percentile(t),
        })
    }

    /// Canonical name (`count`, `median`, `tp99`, `tp99.9`, ...)
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            Statistic::Count => Cow::Borrowed("count"),
            Statistic::Sum => Cow::Borrowed("sum"),
            Statistic::Mean => Cow::Borrowed("mean"),
            Statistic::Min => Cow::Borrowed("min"),
            Statistic::Max => Cow::Borrowed("max"),
            Statistic::Histogram => Cow::Borrowed("histogram"),
            Statistic::Percentile(500) => Cow::Borrowed("median"),
            Statistic::Percentile(t) if t % 10 == 0 => Cow::Owned(format!("tp{}", t / 10)),
            Statistic::Percentile(t) => Cow::Owned(format!("tp{}.{}", t / 10, t % 10)),
        }
    }

    /// Percentile value in `[0, 100]` for order statistics
    pub fn percentile_value(&self) -> Option<f64> {
        match self {
            Statistic::Min => Some(0.0),
            Statistic::Max => Some(100.0),
            Statistic::Percentile(t) => Some(f64::from(*t) / 10.0),
            _ => None,
        }
    }

    /// Statistics that must be computed over the same samples first
    pub fn dependencies(&self) -> &'static [Statistic] {
        match self {
            Statistic::Mean => &MEAN_DEPENDENCIES,
            Statistic::Percentile(_) => &PERCENTILE_DEPENDENCIES,
            _ => &NO_DEPENDENCIES,
        }
    }

    /// Whether the value counts samples rather than measuring them
    ///
    /// Such values are unit-less whatever the samples' unit.
    pub fn is_dimensionless(&self) -> bool {
        matches!(self, Statistic::Count | Statistic::Histogram)
    }

    /// Whether partial results merge through supporting data
    pub fn is_mergeable(&self) -> bool {
        matches!(self, Statistic::Histogram)
    }

    /// Evaluate over `samples` with default histogram precision and no
    /// precomputed dependencies
    pub fn calculate(&self, samples: &[Quantity]) -> Result<Option<CalculatedValue>> {
        self.calculate_with(samples, DEFAULT_PRECISION_BITS, &HashMap::new())
    }

    /// Evaluate over `samples`
    ///
    /// `dependencies` holds already-computed results over the same samples;
    /// `Mean` uses `Sum` and `Count` from it when both are present.
    ///
    /// Returns `Ok(None)` when the statistic has no value for an empty sample
    /// set. `Count` and `Sum` of nothing are zero.
    ///
    /// # Errors
    ///
    /// `IncompatibleUnit` if the samples cannot be brought to one unit.
    pub fn calculate_with(
        &self,
        samples: &[Quantity],
        precision_bits: u8,
        dependencies: &HashMap<Statistic, CalculatedValue>,
    ) -> Result<Option<CalculatedValue>> {
        let samples = normalized(samples)?;
        let unit = samples.first().and_then(|q| q.unit());
        let value = match self {
            Statistic::Count => Some(Quantity::unitless(samples.len() as f64)),
            Statistic::Sum => Some(sum_of(&samples, unit)),
            Statistic::Mean => {
                let precomputed = dependencies
                    .get(&Statistic::Sum)
                    .zip(dependencies.get(&Statistic::Count));
                match precomputed {
                    Some((sum, count)) if count.value.value() > 0.0 => Some(Quantity::new(
                        sum.value.value() / count.value.value(),
                        sum.value.unit(),
                    )),
                    _ if samples.is_empty() => None,
                    _ => Some(Quantity::new(
                        sum_of(&samples, unit).value() / samples.len() as f64,
                        unit,
                    )),
                }
            },
            Statistic::Min | Statistic::Max | Statistic::Percentile(_) => {
                let mut values: Vec<f64> = samples.iter().map(|q| q.value()).collect();
                values.sort_by(f64::total_cmp);
                self.rank_index(values.len())
                    .map(|idx| Quantity::new(values[idx], unit))
            },
            Statistic::Histogram => {
                let data = HistogramSupportingData::from_samples(&samples, precision_bits)?;
                let entries = Quantity::unitless(data.histogram().entries() as f64);
                return Ok(Some(CalculatedValue::with_histogram(entries, data)));
            },
        };
        Ok(value.map(CalculatedValue::scalar))
    }

    /// Nearest-rank index into `n` sorted samples
    ///
    /// `ceil(p / 100 * (n - 1))`, evaluated in integer tenths so the result
    /// is exact. `None` for an empty set.
    fn rank_index(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let tenths = match self {
            Statistic::Min => 0,
            Statistic::Max => TENTHS_PER_HUNDRED,
            Statistic::Percentile(t) => u64::from(*t),
            _ => return None,
        };
        let last = (n - 1) as u64;
        let idx = (tenths * last + TENTHS_PER_HUNDRED - 1) / TENTHS_PER_HUNDRED;
        Some(idx.min(last) as usize)
    }

    /// Combine per-host scalar values into a cluster value
    ///
    /// Counts and sums add, min/max take the extreme, means average. Order
    /// statistics and histograms cannot be reduced from scalars and return
    /// `UnsupportedOperation`; the cluster tier handles them separately.
    pub fn reduce(&self, partials: &[Quantity]) -> Result<Option<Quantity>> {
        let reducer = match self {
            Statistic::Count | Statistic::Sum => Statistic::Sum,
            Statistic::Min => Statistic::Min,
            Statistic::Max => Statistic::Max,
            Statistic::Mean => Statistic::Mean,
            Statistic::Percentile(_) | Statistic::Histogram => {
                return Err(Error::UnsupportedOperation(format!(
                    "{} cannot be reduced from per-host values",
                    self
                )))
            },
        };
        if partials.is_empty() {
            return Ok(None);
        }
        Ok(reducer.calculate(partials)?.map(|c| c.value))
    }
}

fn sum_of(samples: &[Quantity], unit: Option<Unit>) -> Quantity {
    Quantity::new(samples.iter().map(|q| q.value()).sum(), unit)
}

// Borrow when the samples already share a unit; otherwise convert to the smallest
fn normalized(samples: &[Quantity]) -> Result<Cow<'_, [Quantity]>> {
    let first = samples.first().and_then(|q| q.unit());
    if samples.iter().all(|q| q.unit() == first) {
        Ok(Cow::Borrowed(samples))
    } else {
        Ok(Cow::Owned(Quantity::unify(samples)?))
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for Statistic {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for Statistic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        StatisticFactory::get_statistic(&name).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unitless(values: impl IntoIterator<Item = f64>) -> Vec<Quantity> {
        values.into_iter().map(Quantity::unitless).collect()
    }

    fn value_of(stat: Statistic, samples: &[Quantity]) -> f64 {
        stat.calculate(samples).unwrap().unwrap().value.value()
    }

    #[test]
    fn test_percentile_law() {
        let five = unitless([3.0, 1.0, 5.0, 2.0, 4.0]);
        assert_eq!(value_of(Statistic::Min, &five), 1.0);
        assert_eq!(value_of(Statistic::Max, &five), 5.0);

        let hundred = unitless((0..100).map(f64::from));
        assert_eq!(value_of(Statistic::MEDIAN, &hundred), 50.0);
        assert_eq!(value_of(Statistic::percentile(99.0).unwrap(), &hundred), 99.0);

        let ten_thousand = unitless((0..10_000).map(f64::from));
        assert_eq!(value_of(Statistic::percentile(99.9).unwrap(), &ten_thousand), 9990.0);
    }

    #[test]
    fn test_does_not_mutate_input() {
        let samples = unitless([3.0, 1.0, 2.0]);
        let before = samples.clone();
        Statistic::MEDIAN.calculate(&samples).unwrap();
        assert_eq!(samples, before);
    }

    #[test]
    fn test_empty_samples() {
        assert_eq!(value_of(Statistic::Count, &[]), 0.0);
        assert_eq!(value_of(Statistic::Sum, &[]), 0.0);
        assert!(Statistic::Mean.calculate(&[]).unwrap().is_none());
        assert!(Statistic::Min.calculate(&[]).unwrap().is_none());
        assert!(Statistic::MEDIAN.calculate(&[]).unwrap().is_none());
    }

    #[test]
    fn test_sum_mean_keep_unit() {
        let samples = vec![
            Quantity::with_unit(1.0, Unit::Second),
            Quantity::with_unit(500.0, Unit::Millisecond),
        ];
        let sum = Statistic::Sum.calculate(&samples).unwrap().unwrap().value;
        assert_eq!(sum, Quantity::with_unit(1500.0, Unit::Millisecond));
        let mean = Statistic::Mean.calculate(&samples).unwrap().unwrap().value;
        assert_eq!(mean, Quantity::with_unit(750.0, Unit::Millisecond));
    }

    #[test]
    fn test_mean_uses_dependencies() {
        let mut deps = HashMap::new();
        deps.insert(Statistic::Sum, CalculatedValue::scalar(Quantity::unitless(10.0)));
        deps.insert(Statistic::Count, CalculatedValue::scalar(Quantity::unitless(4.0)));
        let mean = Statistic::Mean
            .calculate_with(&[], DEFAULT_PRECISION_BITS, &deps)
            .unwrap()
            .unwrap();
        assert_eq!(mean.value, Quantity::unitless(2.5));
    }

    #[test]
    fn test_incompatible_samples() {
        let samples = vec![Quantity::unitless(1.0), Quantity::with_unit(1.0, Unit::Second)];
        assert!(matches!(
            Statistic::Sum.calculate(&samples),
            Err(Error::IncompatibleUnit { .. })
        ));
    }

    #[test]
    fn test_histogram_value_and_data() {
        let result = Statistic::Histogram
            .calculate(&unitless([1.0, 1.0, 2.0]))
            .unwrap()
            .unwrap();
        assert_eq!(result.value, Quantity::unitless(3.0));
        let data = result.supporting_data.unwrap();
        assert_eq!(data.histogram().iter().collect::<Vec<_>>(), vec![(1.0, 2), (2.0, 1)]);
    }

    #[test]
    fn test_names() {
        assert_eq!(Statistic::MEDIAN.name(), "median");
        assert_eq!(Statistic::percentile(99.0).unwrap().name(), "tp99");
        assert_eq!(Statistic::percentile(99.9).unwrap().name(), "tp99.9");
        assert_eq!(Statistic::percentile(0.0).unwrap(), Statistic::Min);
        assert_eq!(Statistic::percentile(100.0).unwrap(), Statistic::Max);
        assert!(Statistic::percentile(99.95).is_err());
        assert!(Statistic::percentile(101.0).is_err());
    }

    #[test]
    fn test_dependencies() {
        assert_eq!(Statistic::Mean.dependencies(), &[Statistic::Sum, Statistic::Count]);
        assert_eq!(Statistic::MEDIAN.dependencies(), &[Statistic::Histogram]);
        assert!(Statistic::Min.dependencies().is_empty());
        assert!(Statistic::Histogram.is_mergeable());
        assert!(!Statistic::Sum.is_mergeable());
        assert!(Statistic::Count.is_dimensionless());
        assert!(Statistic::Histogram.is_dimensionless());
        assert!(!Statistic::Mean.is_dimensionless());
    }

    #[test]
    fn test_reduce() {
        let hosts = unitless([3.0, 5.0]);
        assert_eq!(Statistic::Count.reduce(&hosts).unwrap(), Some(Quantity::unitless(8.0)));
        assert_eq!(Statistic::Sum.reduce(&hosts).unwrap(), Some(Quantity::unitless(8.0)));
        assert_eq!(Statistic::Max.reduce(&hosts).unwrap(), Some(Quantity::unitless(5.0)));
        assert_eq!(Statistic::Min.reduce(&hosts).unwrap(), Some(Quantity::unitless(3.0)));
        assert_eq!(Statistic::Mean.reduce(&hosts).unwrap(), Some(Quantity::unitless(4.0)));
        assert!(Statistic::MEDIAN.reduce(&hosts).is_err());
        assert_eq!(Statistic::Sum.reduce(&[]).unwrap(), None);
    }

    #[test]
    fn test_serde_by_name() {
        let json = serde_json::to_string(&Statistic::percentile(99.9).unwrap()).unwrap();
        assert_eq!(json, "\"tp99.9\"");
        let back: Statistic = serde_json::from_str("\"P99.9\"").unwrap();
        assert_eq!(back, Statistic::Percentile(999));
    }
}
