//! Input records handed to the aggregator by the ingestion layer

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::quantity::Quantity;

/// Kind of a metric, selecting which statistics are computed for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic or delta counts
    Counter,
    /// Point-in-time readings
    Gauge,
    /// Latencies and durations
    Timer,
}

impl MetricKind {
    /// All metric kinds
    pub const ALL: [MetricKind; 3] = [MetricKind::Counter, MetricKind::Gauge, MetricKind::Timer];

    /// Lower-case name
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Timer => "timer",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Samples of one named metric inside a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Declared kind
    pub kind: MetricKind,
    /// Samples in the order they were observed
    pub values: Vec<Quantity>,
}

impl Metric {
    /// Create a metric from its kind and samples
    pub fn new(kind: MetricKind, values: Vec<Quantity>) -> Self {
        Self { kind, values }
    }
}

/// Origin of a record: which cluster, service and host produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    /// Cluster name
    pub cluster: String,
    /// Service name
    pub service: String,
    /// Reporting host
    pub host: String,
}

impl Identity {
    /// Create an identity
    pub fn new(
        cluster: impl Into<String>,
        service: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            service: service.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.service, self.host)
    }
}

/// A timestamped batch of metric samples
///
/// Records without an identity are attributed to the aggregator's own
/// configured identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Time the samples were taken
    pub time: DateTime<Utc>,
    /// Samples keyed by metric name
    pub metrics: HashMap<String, Metric>,
    /// Optional explicit origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

impl Record {
    /// Create an empty record at `time`
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            metrics: HashMap::new(),
            identity: None,
        }
    }

    /// Attach an explicit identity
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Add (or extend) a metric
    ///
    /// Samples for a name already present are appended; the kind of the
    /// first declaration wins.
    pub fn with_metric(
        mut self,
        name: impl Into<String>,
        kind: MetricKind,
        values: impl IntoIterator<Item = Quantity>,
    ) -> Self {
        self.metrics
            .entry(name.into())
            .or_insert_with(|| Metric::new(kind, Vec::new()))
            .values
            .extend(values);
        self
    }

    /// Total number of samples across all metrics
    pub fn sample_count(&self) -> usize {
        self.metrics.values().map(|m| m.values.len()).sum()
    }
}
