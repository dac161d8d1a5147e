//! Cross-host combination of statistic sets for one metric and window
//!
//! Every statistic keeps one contribution per reporting host. A redelivered
//! record from the same host replaces that host's earlier contribution, so
//! at-least-once delivery never double counts. The cluster value is derived
//! from the contributions on demand:
//!
//! ```text
//!   host-a: {count: 3, sum: 6, histogram: {1:1, 2:1, 3:1}}
//!   host-b: {count: 1, sum: 4, histogram: {4:1}}
//!                      │ compute()
//!                      ▼
//!   count 4 · sum 10 · mean 2.5 · histogram {1:1, 2:1, 3:1, 4:1}
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::warn;

use super::policy::PercentilePolicy;
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{Period, Quantity, StatisticSetRecord};
use crate::statistics::{CalculatedValue, HistogramSupportingData, Statistic, StatisticFactory};

/// Identity of a combined window: (cluster, service, metric, period, start)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CombinedKey {
    /// Cluster name
    pub cluster: String,
    /// Service name
    pub service: String,
    /// Metric name
    pub metric: String,
    /// Window length
    pub period: Period,
    /// Window start
    pub period_start: DateTime<Utc>,
}

impl CombinedKey {
    /// Key a statistic set record belongs to
    pub fn of(record: &StatisticSetRecord) -> Self {
        Self {
            cluster: record.cluster.clone(),
            service: record.service.clone(),
            metric: record.metric.clone(),
            period: record.period,
            period_start: record.period_start,
        }
    }
}

/// Per-host contributions to one statistic
#[derive(Debug, Clone, Default)]
pub struct CombinedStatistic {
    contributions: BTreeMap<String, CalculatedValue>,
    user_specified: bool,
}

impl CombinedStatistic {
    /// Whether any host was asked to emit this statistic
    pub fn is_user_specified(&self) -> bool {
        self.user_specified
    }

    /// Hosts that contributed
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.contributions.keys().map(String::as_str)
    }

    /// Per-host scalar values, ordered by host
    pub fn values(&self) -> Vec<Quantity> {
        self.contributions.values().map(|c| c.value).collect()
    }
}

/// Summary of one [`CombinedMetricData::merge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeSummary {
    /// Statistic entries taken
    pub merged: usize,
    /// Entries skipped (unknown name, bad supporting data)
    pub skipped: usize,
}

/// A combined statistic value ready to emit
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedValue {
    /// Statistic
    pub statistic: Statistic,
    /// Cluster value and merged supporting data
    pub value: CalculatedValue,
    /// Whether any host was asked to emit it
    pub user_specified: bool,
}

/// Statistics of one metric window, combined across hosts
#[derive(Debug, Clone)]
pub struct CombinedMetricData {
    key: CombinedKey,
    statistics: BTreeMap<Statistic, CombinedStatistic>,
    hosts: BTreeSet<String>,
}

impl CombinedMetricData {
    /// Empty combination for `key`
    pub fn new(key: CombinedKey) -> Self {
        Self {
            key,
            statistics: BTreeMap::new(),
            hosts: BTreeSet::new(),
        }
    }

    /// Start a combination from a first record
    pub fn from_record(record: &StatisticSetRecord) -> Result<Self> {
        let mut combined = Self::new(CombinedKey::of(record));
        combined.merge(record)?;
        Ok(combined)
    }

    /// Window identity
    pub fn key(&self) -> &CombinedKey {
        &self.key
    }

    /// Hosts that have contributed
    pub fn hosts(&self) -> &BTreeSet<String> {
        &self.hosts
    }

    /// Contributions for `statistic`
    pub fn statistic(&self, statistic: &Statistic) -> Option<&CombinedStatistic> {
        self.statistics.get(statistic)
    }

    /// Statistics with at least one contribution
    pub fn statistics(&self) -> impl Iterator<Item = &Statistic> {
        self.statistics.keys()
    }

    /// Merge one host's record
    ///
    /// Unknown statistic names and undecodable supporting data are skipped
    /// with a warning. The host's earlier contribution to a statistic, if
    /// any, is replaced.
    ///
    /// # Errors
    ///
    /// `MismatchedRecord` if the record belongs to a different window.
    pub fn merge(&mut self, record: &StatisticSetRecord) -> Result<MergeSummary> {
        let key = CombinedKey::of(record);
        if key != self.key {
            return Err(Error::MismatchedRecord(format!(
                "{}/{}/{} {} @ {} routed to {}/{}/{} {} @ {}",
                key.cluster,
                key.service,
                key.metric,
                key.period,
                key.period_start,
                self.key.cluster,
                self.key.service,
                self.key.metric,
                self.key.period,
                self.key.period_start
            )));
        }

        let mut summary = MergeSummary::default();
        for entry in &record.statistics {
            let Some(statistic) = StatisticFactory::try_get_statistic(&entry.statistic) else {
                warn!(
                    statistic = %entry.statistic,
                    host = %record.host,
                    metric = %record.metric,
                    "Skipping unknown statistic"
                );
                metrics::UNKNOWN_STATISTICS
                    .with_label_values(&[entry.statistic.as_str()])
                    .inc();
                summary.skipped += 1;
                continue;
            };

            let supporting_data = match entry.supporting_data.as_deref() {
                Some(bytes) => match HistogramSupportingData::decode(bytes) {
                    Ok(data) => Some(data),
                    Err(e) => {
                        warn!(
                            statistic = %statistic,
                            host = %record.host,
                            error = %e,
                            "Skipping statistic with undecodable supporting data"
                        );
                        summary.skipped += 1;
                        continue;
                    },
                },
                None if statistic.is_mergeable() => {
                    warn!(
                        statistic = %statistic,
                        host = %record.host,
                        "Skipping mergeable statistic without supporting data"
                    );
                    summary.skipped += 1;
                    continue;
                },
                None => None,
            };

            let combined = self.statistics.entry(statistic).or_default();
            combined.user_specified |= entry.user_specified;
            combined.contributions.insert(
                record.host.clone(),
                CalculatedValue {
                    value: entry.quantity(),
                    supporting_data,
                },
            );
            summary.merged += 1;
        }
        self.hosts.insert(record.host.clone());
        Ok(summary)
    }

    /// Histogram merged across every host, if any host sent one
    pub fn merged_histogram(&self) -> Result<Option<HistogramSupportingData>> {
        let Some(combined) = self.statistics.get(&Statistic::Histogram) else {
            return Ok(None);
        };
        let mut merged: Option<HistogramSupportingData> = None;
        for data in combined
            .contributions
            .values()
            .filter_map(|c| c.supporting_data.as_ref())
        {
            match merged.as_mut() {
                Some(acc) => acc.merge(data)?,
                None => merged = Some(data.clone()),
            }
        }
        Ok(merged)
    }

    /// Merged count across hosts, if any host sent a count
    pub fn merged_count(&self) -> Option<f64> {
        self.reduce(&Statistic::Count).ok().flatten().map(|q| q.value())
    }

    fn reduce(&self, statistic: &Statistic) -> Result<Option<Quantity>> {
        match self.statistics.get(statistic) {
            Some(combined) => statistic.reduce(&combined.values()),
            None => Ok(None),
        }
    }

    /// Compute one statistic's cluster value
    pub fn compute_statistic(
        &self,
        statistic: &Statistic,
        policy: PercentilePolicy,
    ) -> Result<Option<CalculatedValue>> {
        let Some(combined) = self.statistics.get(statistic) else {
            return Ok(None);
        };
        match statistic {
            Statistic::Histogram => Ok(self.merged_histogram()?.map(|data| {
                let entries = Quantity::unitless(data.histogram().entries() as f64);
                CalculatedValue::with_histogram(entries, data)
            })),
            Statistic::Mean => {
                let sum = self.reduce(&Statistic::Sum)?;
                let count = self.reduce(&Statistic::Count)?;
                match (sum, count) {
                    (Some(sum), Some(count)) if count.value() > 0.0 => {
                        Ok(Some(CalculatedValue::scalar(Quantity::new(
                            sum.value() / count.value(),
                            sum.unit(),
                        ))))
                    },
                    _ => Ok(statistic
                        .reduce(&combined.values())?
                        .map(CalculatedValue::scalar)),
                }
            },
            Statistic::Percentile(_) => {
                self.compute_percentile(statistic, combined, policy)
            },
            _ => Ok(statistic
                .reduce(&combined.values())?
                .map(CalculatedValue::scalar)),
        }
    }

    fn compute_percentile(
        &self,
        statistic: &Statistic,
        combined: &CombinedStatistic,
        policy: PercentilePolicy,
    ) -> Result<Option<CalculatedValue>> {
        let percentile = statistic.percentile_value().unwrap_or(50.0);
        match policy {
            PercentilePolicy::FromHistogram => match self.merged_histogram()? {
                Some(histogram) => Ok(histogram
                    .value_at_percentile(percentile)
                    .map(CalculatedValue::scalar)),
                None => Err(Error::UnsupportedOperation(format!(
                    "{} needs histogram supporting data from its hosts",
                    statistic
                ))),
            },
            PercentilePolicy::MeanOfHosts => Ok(Statistic::Mean
                .reduce(&combined.values())?
                .map(CalculatedValue::scalar)),
            PercentilePolicy::Reject => {
                let values = combined.values();
                if values.len() > 1 {
                    return Err(Error::UnsupportedOperation(format!(
                        "{} reported by {} hosts cannot be combined",
                        statistic,
                        values.len()
                    )));
                }
                Ok(values.first().copied().map(CalculatedValue::scalar))
            },
        }
    }

    /// Compute every statistic, skipping (and logging) the ones that fail
    pub fn compute(&self, policy: PercentilePolicy) -> Vec<CombinedValue> {
        let mut out = Vec::with_capacity(self.statistics.len());
        for (statistic, combined) in &self.statistics {
            match self.compute_statistic(statistic, policy) {
                Ok(Some(value)) => out.push(CombinedValue {
                    statistic: *statistic,
                    value,
                    user_specified: combined.user_specified,
                }),
                Ok(None) => {},
                Err(e) => {
                    warn!(
                        cluster = %self.key.cluster,
                        service = %self.key.service,
                        metric = %self.key.metric,
                        statistic = %statistic,
                        error = %e,
                        "Cluster statistic computation failed"
                    );
                    metrics::record_statistic_error(&statistic.name());
                },
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StatisticRecord, Unit};
    use chrono::TimeZone;

    fn histogram_bytes(values: &[f64]) -> Vec<u8> {
        let samples: Vec<Quantity> = values.iter().map(|v| Quantity::unitless(*v)).collect();
        HistogramSupportingData::from_samples(&samples, 7)
            .unwrap()
            .encode()
            .unwrap()
    }

    fn entry(statistic: &str, value: f64, user_specified: bool) -> StatisticRecord {
        StatisticRecord {
            statistic: statistic.to_string(),
            value,
            unit: None,
            supporting_data: None,
            user_specified,
        }
    }

    fn record(host: &str, statistics: Vec<StatisticRecord>) -> StatisticSetRecord {
        StatisticSetRecord {
            cluster: "c".to_string(),
            service: "s".to_string(),
            metric: "latency".to_string(),
            host: host.to_string(),
            period: Period::from_secs(60).unwrap(),
            period_start: Utc.timestamp_opt(600, 0).unwrap(),
            statistics,
        }
    }

    fn host_record(host: &str, values: &[f64]) -> StatisticSetRecord {
        let sum: f64 = values.iter().sum();
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        let mut hist = entry("histogram", values.len() as f64, false);
        hist.supporting_data = Some(histogram_bytes(values));
        record(
            host,
            vec![
                entry("count", values.len() as f64, false),
                entry("sum", sum, true),
                entry("mean", sum / values.len() as f64, true),
                entry("max", max, true),
                entry("tp50", values[values.len() / 2], true),
                hist,
            ],
        )
    }

    fn value_of(values: &[CombinedValue], statistic: Statistic) -> f64 {
        values
            .iter()
            .find(|v| v.statistic == statistic)
            .unwrap()
            .value
            .value
            .value()
    }

    #[test]
    fn test_combines_hosts() {
        let mut combined = CombinedMetricData::from_record(&host_record("a", &[1.0, 2.0, 3.0])).unwrap();
        combined.merge(&host_record("b", &[4.0])).unwrap();

        let values = combined.compute(PercentilePolicy::FromHistogram);
        assert_eq!(value_of(&values, Statistic::Count), 4.0);
        assert_eq!(value_of(&values, Statistic::Sum), 10.0);
        assert_eq!(value_of(&values, Statistic::Mean), 2.5);
        assert_eq!(value_of(&values, Statistic::Max), 4.0);
        assert_eq!(value_of(&values, Statistic::Histogram), 4.0);
        // histogram over {1,2,3,4}: target floor(4 * 0.5) = 2 → third bucket
        assert_eq!(value_of(&values, Statistic::MEDIAN), 3.0);
        assert_eq!(combined.hosts().len(), 2);
    }

    #[test]
    fn test_redelivery_replaces_contribution() {
        let mut combined = CombinedMetricData::from_record(&host_record("a", &[1.0, 2.0])).unwrap();
        combined.merge(&host_record("a", &[1.0, 2.0])).unwrap();
        let values = combined.compute(PercentilePolicy::FromHistogram);
        assert_eq!(value_of(&values, Statistic::Count), 2.0);
        assert_eq!(value_of(&values, Statistic::Sum), 3.0);
        assert_eq!(value_of(&values, Statistic::Histogram), 2.0);
    }

    #[test]
    fn test_unknown_statistic_skipped() {
        let mut r = host_record("a", &[1.0]);
        r.statistics.push(entry("stddev", 0.0, true));
        let mut combined = CombinedMetricData::new(CombinedKey::of(&r));
        let summary = combined.merge(&r).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.merged, 6);
    }

    #[test]
    fn test_bad_supporting_data_skipped() {
        let mut hist = entry("histogram", 1.0, false);
        hist.supporting_data = Some(b"garbage".to_vec());
        let r = record("a", vec![hist, entry("histogram", 1.0, false), entry("sum", 1.0, true)]);
        let mut combined = CombinedMetricData::new(CombinedKey::of(&r));
        let summary = combined.merge(&r).unwrap();
        assert_eq!(summary, MergeSummary { merged: 1, skipped: 2 });
        assert!(combined.statistic(&Statistic::Histogram).is_none());
    }

    #[test]
    fn test_mismatched_record() {
        let mut combined = CombinedMetricData::from_record(&host_record("a", &[1.0])).unwrap();
        let mut other = host_record("b", &[1.0]);
        other.metric = "other".to_string();
        assert!(matches!(combined.merge(&other), Err(Error::MismatchedRecord(_))));
    }

    #[test]
    fn test_user_specified_is_sticky() {
        let mut combined =
            CombinedMetricData::from_record(&record("a", vec![entry("min", 1.0, true)])).unwrap();
        combined.merge(&record("b", vec![entry("min", 0.5, false)])).unwrap();
        let stat = combined.statistic(&Statistic::Min).unwrap();
        assert!(stat.is_user_specified());
        let values = combined.compute(PercentilePolicy::Reject);
        assert_eq!(value_of(&values, Statistic::Min), 0.5);
    }

    #[test]
    fn test_percentile_policies() {
        let mut combined =
            CombinedMetricData::from_record(&record("a", vec![entry("p99", 10.0, true)])).unwrap();
        combined.merge(&record("b", vec![entry("p99", 20.0, true)])).unwrap();
        let p99 = Statistic::Percentile(990);

        assert!(combined
            .compute_statistic(&p99, PercentilePolicy::FromHistogram)
            .is_err());
        assert!(combined.compute_statistic(&p99, PercentilePolicy::Reject).is_err());
        let mean = combined
            .compute_statistic(&p99, PercentilePolicy::MeanOfHosts)
            .unwrap()
            .unwrap();
        assert_eq!(mean.value, Quantity::unitless(15.0));
        assert!(combined.compute(PercentilePolicy::Reject).is_empty());
    }

    #[test]
    fn test_mean_of_hosts_fallback_without_sum() {
        let mut combined =
            CombinedMetricData::from_record(&record("a", vec![entry("mean", 2.0, true)])).unwrap();
        combined.merge(&record("b", vec![entry("mean", 4.0, true)])).unwrap();
        let values = combined.compute(PercentilePolicy::FromHistogram);
        assert_eq!(value_of(&values, Statistic::Mean), 3.0);
    }

    #[test]
    fn test_units_converted_across_hosts() {
        let mut a = entry("max", 1.0, true);
        a.unit = Some(Unit::Second);
        let mut b = entry("max", 1500.0, true);
        b.unit = Some(Unit::Millisecond);
        let mut combined = CombinedMetricData::from_record(&record("a", vec![a])).unwrap();
        combined.merge(&record("b", vec![b])).unwrap();
        let max = combined
            .compute_statistic(&Statistic::Max, PercentilePolicy::FromHistogram)
            .unwrap()
            .unwrap();
        assert_eq!(max.value, Quantity::with_unit(1500.0, Unit::Millisecond));
    }
}
