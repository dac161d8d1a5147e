//! Specified/dependent statistic sets and their per-metric configuration

use std::collections::BTreeSet;
use std::sync::Arc;

use regex::Regex;

use super::histogram::{Histogram, DEFAULT_PRECISION_BITS};
use super::Statistic;
use crate::error::Result;
use crate::model::MetricKind;

/// Statistics to compute for one metric
///
/// `specified` are requested for output; `dependent` holds everything
/// reachable through [`Statistic::dependencies`] that is not itself
/// specified.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatisticSelection {
    specified: BTreeSet<Statistic>,
    dependent: BTreeSet<Statistic>,
}

impl StatisticSelection {
    /// Resolve the transitive dependency closure of `specified`
    pub fn resolve(specified: impl IntoIterator<Item = Statistic>) -> Self {
        let specified: BTreeSet<Statistic> = specified.into_iter().collect();
        let mut dependent = BTreeSet::new();
        let mut pending: Vec<Statistic> = specified.iter().copied().collect();
        while let Some(statistic) = pending.pop() {
            for dep in statistic.dependencies() {
                if !specified.contains(dep) && dependent.insert(*dep) {
                    pending.push(*dep);
                }
            }
        }
        Self {
            specified,
            dependent,
        }
    }

    /// Resolve `specified` and additionally compute `extra` as dependents
    ///
    /// Entries of `extra` that are also specified stay specified.
    pub fn with_dependent(
        specified: impl IntoIterator<Item = Statistic>,
        extra: impl IntoIterator<Item = Statistic>,
    ) -> Self {
        let mut selection = Self::resolve(specified);
        let mut pending: Vec<Statistic> = extra.into_iter().collect();
        while let Some(statistic) = pending.pop() {
            if selection.specified.contains(&statistic) || !selection.dependent.insert(statistic) {
                continue;
            }
            pending.extend(statistic.dependencies().iter().copied());
        }
        selection
    }

    /// Statistics requested for output
    pub fn specified(&self) -> &BTreeSet<Statistic> {
        &self.specified
    }

    /// Statistics computed only as inputs to others
    pub fn dependent(&self) -> &BTreeSet<Statistic> {
        &self.dependent
    }

    /// Whether `statistic` was requested for output
    pub fn is_specified(&self, statistic: &Statistic) -> bool {
        self.specified.contains(statistic)
    }

    /// Number of statistics to compute
    pub fn len(&self) -> usize {
        self.specified.len() + self.dependent.len()
    }

    /// Whether nothing is selected
    pub fn is_empty(&self) -> bool {
        self.specified.is_empty()
    }

    /// Every selected statistic ordered so dependencies come first
    pub fn evaluation_order(&self) -> Vec<Statistic> {
        let all: BTreeSet<Statistic> = self.specified.union(&self.dependent).copied().collect();
        let mut order = Vec::with_capacity(all.len());
        let mut visited = BTreeSet::new();
        for statistic in &all {
            visit(*statistic, &all, &mut visited, &mut order);
        }
        order
    }
}

fn visit(
    statistic: Statistic,
    all: &BTreeSet<Statistic>,
    visited: &mut BTreeSet<Statistic>,
    order: &mut Vec<Statistic>,
) {
    if !visited.insert(statistic) {
        return;
    }
    for dep in statistic.dependencies() {
        if all.contains(dep) {
            visit(*dep, all, visited, order);
        }
    }
    order.push(statistic);
}

#[derive(Debug, Clone)]
struct StatisticOverride {
    pattern: Regex,
    selection: Arc<StatisticSelection>,
}

/// Kind → statistics mapping consumed by buckets
///
/// Overrides are regular expressions over the metric name; the first match
/// replaces the kind's default for that metric.
#[derive(Debug, Clone)]
pub struct StatisticsConfig {
    counter: Arc<StatisticSelection>,
    gauge: Arc<StatisticSelection>,
    timer: Arc<StatisticSelection>,
    overrides: Vec<StatisticOverride>,
    precision_bits: u8,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self::new(
            [Statistic::Mean, Statistic::Sum, Statistic::Count],
            [Statistic::Min, Statistic::Max, Statistic::Mean],
            [
                Statistic::MEDIAN,
                Statistic::Percentile(900),
                Statistic::Percentile(990),
                Statistic::Mean,
                Statistic::Count,
            ],
        )
    }
}

impl StatisticsConfig {
    /// Create a configuration from per-kind specified statistics
    pub fn new(
        counter: impl IntoIterator<Item = Statistic>,
        gauge: impl IntoIterator<Item = Statistic>,
        timer: impl IntoIterator<Item = Statistic>,
    ) -> Self {
        Self {
            counter: Arc::new(StatisticSelection::resolve(counter)),
            gauge: Arc::new(StatisticSelection::resolve(gauge)),
            timer: Arc::new(StatisticSelection::resolve(timer)),
            overrides: Vec::new(),
            precision_bits: DEFAULT_PRECISION_BITS,
        }
    }

    /// Use the same statistics for every kind
    pub fn uniform(statistics: impl IntoIterator<Item = Statistic>) -> Self {
        Self::from_selection(StatisticSelection::resolve(statistics))
    }

    /// Use one precomputed selection for every kind
    pub fn from_selection(selection: StatisticSelection) -> Self {
        let selection = Arc::new(selection);
        Self {
            counter: Arc::clone(&selection),
            gauge: Arc::clone(&selection),
            timer: selection,
            overrides: Vec::new(),
            precision_bits: DEFAULT_PRECISION_BITS,
        }
    }

    /// Add a per-metric override
    ///
    /// # Errors
    ///
    /// `Configuration` if `pattern` is not a valid regular expression.
    pub fn with_override(
        mut self,
        pattern: &str,
        statistics: impl IntoIterator<Item = Statistic>,
    ) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            crate::error::Error::Configuration(format!("invalid override pattern: {}", e))
        })?;
        self.overrides.push(StatisticOverride {
            pattern,
            selection: Arc::new(StatisticSelection::resolve(statistics)),
        });
        Ok(self)
    }

    /// Set the histogram precision used for histogram statistics
    ///
    /// # Errors
    ///
    /// `SupportingData` if outside `1..=52`.
    pub fn with_precision_bits(mut self, precision_bits: u8) -> Result<Self> {
        Histogram::new(precision_bits)?;
        self.precision_bits = precision_bits;
        Ok(self)
    }

    /// Histogram precision in mantissa bits
    pub fn precision_bits(&self) -> u8 {
        self.precision_bits
    }

    /// Default selection for a kind
    pub fn for_kind(&self, kind: MetricKind) -> &Arc<StatisticSelection> {
        match kind {
            MetricKind::Counter => &self.counter,
            MetricKind::Gauge => &self.gauge,
            MetricKind::Timer => &self.timer,
        }
    }

    /// Selection for a metric, honouring overrides
    pub fn selection_for(&self, metric: &str, kind: MetricKind) -> Arc<StatisticSelection> {
        self.overrides
            .iter()
            .find(|o| o.pattern.is_match(metric))
            .map(|o| Arc::clone(&o.selection))
            .unwrap_or_else(|| Arc::clone(self.for_kind(kind)))
    }
}
