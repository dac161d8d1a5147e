//! Aggregation results and the batches they are emitted in

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::fqdsn::Fqdsn;
use super::period::Period;
use super::quantity::Quantity;
use crate::statistics::HistogramSupportingData;

/// Population size of an aggregate whose sample count is not tracked
pub const UNKNOWN_POPULATION: i64 = -1;

/// One computed statistic for one metric, host and window
///
/// Built once by a bucket or the cluster combiner and never changed
/// afterwards; transformations such as unification produce a new value.
/// Equality and hashing cover every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregatedData {
    fqdsn: Fqdsn,
    host: String,
    period: Period,
    period_start: DateTime<Utc>,
    value: Quantity,
    samples: Vec<Quantity>,
    population_size: i64,
    is_specified: bool,
    supporting_data: Option<HistogramSupportingData>,
}

impl AggregatedData {
    /// Create a specified aggregate with no retained samples and unknown
    /// population
    pub fn new(
        fqdsn: Fqdsn,
        host: impl Into<String>,
        period: Period,
        period_start: DateTime<Utc>,
        value: Quantity,
    ) -> Self {
        Self {
            fqdsn,
            host: host.into(),
            period,
            period_start,
            value,
            samples: Vec::new(),
            population_size: UNKNOWN_POPULATION,
            is_specified: true,
            supporting_data: None,
        }
    }

    /// Replace the retained samples
    pub fn with_samples(mut self, samples: Vec<Quantity>) -> Self {
        self.samples = samples;
        self
    }

    /// Set the population size
    pub fn with_population_size(mut self, population_size: i64) -> Self {
        self.population_size = population_size;
        self
    }

    /// Mark as specified (emitted) or dependent (internal)
    pub fn specified(mut self, is_specified: bool) -> Self {
        self.is_specified = is_specified;
        self
    }

    /// Attach supporting data
    pub fn with_supporting_data(mut self, data: Option<HistogramSupportingData>) -> Self {
        self.supporting_data = data;
        self
    }

    /// Statistic identity
    pub fn fqdsn(&self) -> &Fqdsn {
        &self.fqdsn
    }

    /// Reporting host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Window length
    pub fn period(&self) -> Period {
        self.period
    }

    /// Window start
    pub fn period_start(&self) -> DateTime<Utc> {
        self.period_start
    }

    /// Computed value
    pub fn value(&self) -> Quantity {
        self.value
    }

    /// Samples retained alongside the value
    pub fn samples(&self) -> &[Quantity] {
        &self.samples
    }

    /// Number of samples the value was computed from, or -1
    pub fn population_size(&self) -> i64 {
        self.population_size
    }

    /// Whether the statistic was requested for output
    pub fn is_specified(&self) -> bool {
        self.is_specified
    }

    /// Mergeable supporting data
    pub fn supporting_data(&self) -> Option<&HistogramSupportingData> {
        self.supporting_data.as_ref()
    }
}

/// Dimension key for the cluster name
pub const CLUSTER_DIMENSION: &str = "cluster";
/// Dimension key for the service name
pub const SERVICE_DIMENSION: &str = "service";
/// Dimension key for the host name
pub const HOST_DIMENSION: &str = "host";

/// All aggregates produced for one window close
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicData {
    /// Window length
    pub period: Period,
    /// Window start
    pub start: DateTime<Utc>,
    /// Identifying dimensions (`cluster`, `service`, `host`)
    pub dimensions: BTreeMap<String, String>,
    /// Aggregates, specified and dependent
    pub data: Vec<AggregatedData>,
}

impl PeriodicData {
    /// Create a batch
    pub fn new(
        period: Period,
        start: DateTime<Utc>,
        dimensions: BTreeMap<String, String>,
        data: Vec<AggregatedData>,
    ) -> Self {
        Self {
            period,
            start,
            dimensions,
            data,
        }
    }

    /// Look up a dimension
    pub fn dimension(&self, key: &str) -> Option<&str> {
        self.dimensions.get(key).map(String::as_str)
    }

    /// Only the aggregates requested for output
    pub fn specified(&self) -> impl Iterator<Item = &AggregatedData> {
        self.data.iter().filter(|d| d.is_specified())
    }

    /// Number of aggregates
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the batch has no aggregates
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Dimensions for a (cluster, service, host) identity
pub fn dimensions_for(cluster: &str, service: &str, host: &str) -> BTreeMap<String, String> {
    let mut dimensions = BTreeMap::new();
    dimensions.insert(CLUSTER_DIMENSION.to_string(), cluster.to_string());
    dimensions.insert(SERVICE_DIMENSION.to_string(), service.to_string());
    dimensions.insert(HOST_DIMENSION.to_string(), host.to_string());
    dimensions
}
