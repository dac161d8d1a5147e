//! Fully-qualified statistic name

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::statistics::Statistic;

/// (cluster, service, metric, statistic) identity of an aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fqdsn {
    /// Cluster name
    pub cluster: String,
    /// Service name
    pub service: String,
    /// Metric name
    pub metric: String,
    /// Statistic computed over the metric
    pub statistic: Statistic,
}

impl Fqdsn {
    /// Create a new name
    pub fn new(
        cluster: impl Into<String>,
        service: impl Into<String>,
        metric: impl Into<String>,
        statistic: Statistic,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            service: service.into(),
            metric: metric.into(),
            statistic,
        }
    }
}

impl fmt::Display for Fqdsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cluster, self.service, self.metric, self.statistic
        )
    }
}
