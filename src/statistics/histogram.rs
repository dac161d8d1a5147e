//! Sparse quantized histogram used as mergeable supporting data
//!
//! Values are quantized by truncating their IEEE-754 representation: the
//! sign, the exponent and the top `precision_bits` mantissa bits are kept,
//! the rest are zeroed. Every bucket key is therefore a valid `f64` and the
//! relative error of a key against any value it stands for is below
//! `2^-precision_bits` (under 1% at the default of 7 bits).
//!
//! ```text
//!   value  ──truncate──▶  bucket key  ──▶  BTreeMap<key, count>
//!   1.337                 1.3359375
//!   1.338                 1.3359375        (same bucket)
//! ```
//!
//! Merging adds counts bucket-wise, which is associative and commutative as
//! long as both sides use the same precision. Mixed precisions are refused.

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Quantity, Unit};

/// Default number of mantissa bits kept per bucket
pub const DEFAULT_PRECISION_BITS: u8 = 7;

/// Largest meaningful precision (full `f64` mantissa)
pub const MAX_PRECISION_BITS: u8 = 52;

const EXPONENT_AND_SIGN_BITS: u32 = 12;

/// Truncate `value` to a bucket key with `precision_bits` of mantissa
pub fn truncate(value: f64, precision_bits: u8) -> f64 {
    let keep = EXPONENT_AND_SIGN_BITS + u32::from(precision_bits.min(MAX_PRECISION_BITS));
    let mask = if keep >= 64 { u64::MAX } else { u64::MAX << (64 - keep) };
    f64::from_bits(value.to_bits() & mask)
}

fn check_precision(precision_bits: u8) -> Result<()> {
    if precision_bits == 0 || precision_bits > MAX_PRECISION_BITS {
        return Err(Error::SupportingData(format!(
            "histogram precision {} outside 1..={}",
            precision_bits, MAX_PRECISION_BITS
        )));
    }
    Ok(())
}

/// Sparse bucket → count map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Histogram {
    buckets: BTreeMap<OrderedFloat<f64>, u64>,
    entries: u64,
    precision_bits: u8,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
            entries: 0,
            precision_bits: DEFAULT_PRECISION_BITS,
        }
    }
}

impl Histogram {
    /// Create an empty histogram
    ///
    /// # Errors
    ///
    /// Returns `SupportingData` if `precision_bits` is outside `1..=52`.
    pub fn new(precision_bits: u8) -> Result<Self> {
        check_precision(precision_bits)?;
        Ok(Self {
            precision_bits,
            ..Self::default()
        })
    }

    /// Mantissa bits kept per bucket
    pub fn precision_bits(&self) -> u8 {
        self.precision_bits
    }

    /// Total number of recorded values
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Number of distinct buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Record one occurrence of `value`
    pub fn record(&mut self, value: f64) {
        self.record_n(value, 1);
    }

    /// Record `count` occurrences of `value`
    ///
    /// Non-finite values are ignored.
    pub fn record_n(&mut self, value: f64, count: u64) {
        if !value.is_finite() || count == 0 {
            return;
        }
        let key = OrderedFloat(truncate(value, self.precision_bits));
        *self.buckets.entry(key).or_insert(0) += count;
        self.entries += count;
    }

    /// Add every bucket of `other` into `self`
    ///
    /// # Errors
    ///
    /// Returns `SupportingData` when the precisions differ.
    pub fn merge(&mut self, other: &Histogram) -> Result<()> {
        if self.precision_bits != other.precision_bits {
            return Err(Error::SupportingData(format!(
                "cannot merge histograms of precision {} and {}",
                self.precision_bits, other.precision_bits
            )));
        }
        for (key, count) in &other.buckets {
            *self.buckets.entry(*key).or_insert(0) += count;
        }
        self.entries += other.entries;
        Ok(())
    }

    /// Iterate `(bucket, count)` pairs in ascending bucket order
    pub fn iter(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.buckets.iter().map(|(k, c)| (k.into_inner(), *c))
    }

    /// Bucket value at `percentile` (0..=100)
    ///
    /// The target rank is `floor(entries * percentile / 100)`; the result is
    /// the first bucket whose cumulative count exceeds it. Returns `None` for
    /// an empty histogram.
    pub fn value_at_percentile(&self, percentile: f64) -> Option<f64> {
        if self.entries == 0 {
            return None;
        }
        let target = (self.entries as f64 * percentile / 100.0).floor() as u64;
        let mut accumulated = 0u64;
        for (key, count) in &self.buckets {
            accumulated += count;
            if accumulated > target {
                return Some(key.into_inner());
            }
        }
        self.buckets.keys().next_back().map(|k| k.into_inner())
    }

    /// Rescale every bucket by `factor`, re-quantizing the keys
    fn rescaled(&self, factor: f64) -> Histogram {
        let mut out = Histogram {
            buckets: BTreeMap::new(),
            entries: 0,
            precision_bits: self.precision_bits,
        };
        for (key, count) in self.iter() {
            out.record_n(key * factor, count);
        }
        out
    }
}

/// Histogram plus the unit its values are expressed in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistogramSupportingData {
    histogram: Histogram,
    unit: Option<Unit>,
}

impl HistogramSupportingData {
    /// Wrap a histogram
    pub fn new(histogram: Histogram, unit: Option<Unit>) -> Self {
        Self { histogram, unit }
    }

    /// Build from samples that already share one unit
    pub fn from_samples(samples: &[Quantity], precision_bits: u8) -> Result<Self> {
        let mut histogram = Histogram::new(precision_bits)?;
        for sample in samples {
            histogram.record(sample.value());
        }
        let unit = samples.first().and_then(|q| q.unit());
        Ok(Self { histogram, unit })
    }

    /// Underlying histogram
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    /// Unit of the bucket values
    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }

    /// Value at `percentile`, carrying the histogram's unit
    pub fn value_at_percentile(&self, percentile: f64) -> Option<Quantity> {
        self.histogram
            .value_at_percentile(percentile)
            .map(|v| Quantity::new(v, self.unit))
    }

    /// Merge `other` into `self`
    ///
    /// Histograms in different units of one domain are both brought to the
    /// smaller unit first.
    ///
    /// # Errors
    ///
    /// `IncompatibleUnit` across domains or when only one side has a unit;
    /// `SupportingData` on a precision mismatch.
    pub fn merge(&mut self, other: &HistogramSupportingData) -> Result<()> {
        match (self.unit, other.unit) {
            (a, b) if a == b => self.histogram.merge(&other.histogram),
            // An empty side carries no unit information worth enforcing
            (_, _) if other.histogram.is_empty() => Ok(()),
            (_, _) if self.histogram.is_empty() => {
                let mut adopted = other.clone();
                adopted.histogram.merge(&self.histogram)?;
                *self = adopted;
                Ok(())
            },
            (Some(a), Some(b)) => {
                let target = a.smaller(b)?;
                if a != target {
                    self.histogram = self.histogram.rescaled(a.conversion_factor(target)?);
                    self.unit = Some(target);
                }
                if b != target {
                    let converted = other.histogram.rescaled(b.conversion_factor(target)?);
                    self.histogram.merge(&converted)
                } else {
                    self.histogram.merge(&other.histogram)
                }
            },
            (a, b) => Err(Error::incompatible(a, b)),
        }
    }

    /// Encode as JSON bytes for the cross-node transport
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireHistogram {
            unit: self.unit,
            precision_bits: self.histogram.precision_bits,
            entries: self
                .histogram
                .iter()
                .map(|(bucket, count)| WireEntry { bucket, count })
                .collect(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decode bytes produced by [`encode`](Self::encode)
    ///
    /// # Errors
    ///
    /// `SupportingData` for malformed payloads, invalid precisions or
    /// non-finite buckets.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireHistogram = serde_json::from_slice(bytes)
            .map_err(|e| Error::SupportingData(format!("malformed histogram: {}", e)))?;
        let mut histogram = Histogram::new(wire.precision_bits)?;
        for entry in wire.entries {
            if !entry.bucket.is_finite() {
                return Err(Error::SupportingData(format!(
                    "non-finite histogram bucket {}",
                    entry.bucket
                )));
            }
            histogram.record_n(entry.bucket, entry.count);
        }
        Ok(Self {
            histogram,
            unit: wire.unit,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct WireHistogram {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<Unit>,
    #[serde(default = "default_precision")]
    precision_bits: u8,
    entries: Vec<WireEntry>,
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    bucket: f64,
    count: u64,
}

fn default_precision() -> u8 {
    DEFAULT_PRECISION_BITS
}
