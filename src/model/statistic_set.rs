//! Per-host statistic sets exchanged with the cluster tier

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aggregated::{PeriodicData, HOST_DIMENSION};
use super::period::Period;
use super::quantity::Quantity;
use super::unit::Unit;
use crate::error::Result;

/// One statistic inside a [`StatisticSetRecord`]
///
/// The statistic is carried by name so that a peer running a newer version
/// can send statistics this node does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticRecord {
    /// Statistic name or alias
    pub statistic: String,
    /// Scalar value
    pub value: f64,
    /// Unit of `value`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
    /// Encoded supporting data, if the statistic has any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_data: Option<Vec<u8>>,
    /// Whether the reporting host was asked to emit this statistic
    pub user_specified: bool,
}

impl StatisticRecord {
    /// Value as a quantity
    pub fn quantity(&self) -> Quantity {
        Quantity::new(self.value, self.unit)
    }
}

/// All statistics one host computed for one metric and window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticSetRecord {
    /// Cluster name
    pub cluster: String,
    /// Service name
    pub service: String,
    /// Metric name
    pub metric: String,
    /// Reporting host
    pub host: String,
    /// Window length
    pub period: Period,
    /// Window start
    pub period_start: DateTime<Utc>,
    /// Statistic entries
    pub statistics: Vec<StatisticRecord>,
}

impl StatisticSetRecord {
    /// Group a closed bucket's output into one record per metric
    ///
    /// Dependent statistics are included (flagged `user_specified = false`)
    /// so the cluster tier can use them as merge inputs.
    pub fn from_periodic_data(batch: &PeriodicData) -> Result<Vec<StatisticSetRecord>> {
        let batch_host = batch.dimension(HOST_DIMENSION).unwrap_or_default();
        let mut grouped: BTreeMap<(&str, &str, &str), StatisticSetRecord> = BTreeMap::new();
        for data in &batch.data {
            let fqdsn = data.fqdsn();
            let host = if data.host().is_empty() {
                batch_host
            } else {
                data.host()
            };
            let record = grouped
                .entry((&fqdsn.cluster, &fqdsn.service, &fqdsn.metric))
                .or_insert_with(|| StatisticSetRecord {
                    cluster: fqdsn.cluster.clone(),
                    service: fqdsn.service.clone(),
                    metric: fqdsn.metric.clone(),
                    host: host.to_string(),
                    period: data.period(),
                    period_start: data.period_start(),
                    statistics: Vec::new(),
                });
            let supporting_data = data.supporting_data().map(|d| d.encode()).transpose()?;
            record.statistics.push(StatisticRecord {
                statistic: fqdsn.statistic.name().into_owned(),
                value: data.value().value(),
                unit: data.value().unit(),
                supporting_data,
                user_specified: data.is_specified(),
            });
        }
        Ok(grouped.into_values().collect())
    }
}
