//! Result of evaluating a statistic

use super::histogram::HistogramSupportingData;
use crate::model::Quantity;

/// Scalar result plus optional mergeable supporting data
#[derive(Debug, Clone, PartialEq)]
pub struct CalculatedValue {
    /// Scalar value
    pub value: Quantity,
    /// Mergeable data backing the value (histograms only)
    pub supporting_data: Option<HistogramSupportingData>,
}

impl CalculatedValue {
    /// Scalar-only value
    pub fn scalar(value: Quantity) -> Self {
        Self {
            value,
            supporting_data: None,
        }
    }

    /// Value backed by a histogram
    pub fn with_histogram(value: Quantity, data: HistogramSupportingData) -> Self {
        Self {
            value,
            supporting_data: Some(data),
        }
    }
}
