//! How order statistics are combined across hosts

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Rule for combining per-host percentiles into a cluster percentile
///
/// Percentiles are not mergeable from scalars: the median of host medians is
/// not the cluster median. The choice is explicit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentilePolicy {
    /// Re-derive from the merged histogram; fails when no host sent one
    #[default]
    FromHistogram,
    /// Average the per-host values
    MeanOfHosts,
    /// Refuse to combine values from more than one host
    Reject,
}

impl PercentilePolicy {
    /// Configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            PercentilePolicy::FromHistogram => "from_histogram",
            PercentilePolicy::MeanOfHosts => "mean_of_hosts",
            PercentilePolicy::Reject => "reject",
        }
    }
}

impl fmt::Display for PercentilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PercentilePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "from_histogram" => Ok(PercentilePolicy::FromHistogram),
            "mean_of_hosts" => Ok(PercentilePolicy::MeanOfHosts),
            "reject" => Ok(PercentilePolicy::Reject),
            other => Err(Error::Configuration(format!(
                "unknown percentile policy: {}",
                other
            ))),
        }
    }
}
