//! Per-window sample accumulator
//!
//! A [`Bucket`] collects the samples of one identity (cluster, service, host)
//! for one window of one period. It is `Open` until [`Bucket::close`] is
//! called, after which it is terminal:
//!
//! ```text
//!        add()                       close()
//!   ┌──────────┐                ┌───────────────┐
//!   │          ▼                │               ▼
//!   │       ┌──────┐   close()  │          ┌────────┐
//!   └───────│ Open │────────────┘          │ Closed │──┐ add() → Rejected
//!           └──────┘                       └────────┘◀─┘ close() → no-op
//! ```
//!
//! Closing computes, for every metric seen, the configured statistics plus
//! their dependencies and hands one [`PeriodicData`] batch to the sink.
//! A failure while computing one metric or one statistic is logged and
//! counted; the rest of the batch is still emitted.
//!
//! A bucket is mutated through `&mut self`; callers that share buckets
//! across threads serialize access per bucket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::metrics;
use crate::model::{
    dimensions_for, AggregatedData, Fqdsn, Identity, MetricKind, Period, PeriodicData, Quantity,
    Record,
};
use crate::sink::Sink;
use crate::statistics::{CalculatedValue, Statistic, StatisticsConfig};

/// Lifecycle state of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Accepting samples
    Open,
    /// Emitted; terminal
    Closed,
}

/// Result of [`Bucket::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Record was accumulated
    Added {
        /// Samples stored
        accepted: usize,
        /// Non-finite samples discarded
        discarded: usize,
    },
    /// Bucket already closed; nothing was stored
    Rejected,
}

/// Samples of one kind, by metric name, in arrival order
type SampleMap = HashMap<String, Vec<Quantity>>;

/// Accumulator for one identity and one window
pub struct Bucket {
    identity: Identity,
    period: Period,
    start: DateTime<Utc>,
    config: Arc<StatisticsConfig>,
    sink: Arc<dyn Sink>,
    state: BucketState,
    counters: SampleMap,
    gauges: SampleMap,
    timers: SampleMap,
}

impl Bucket {
    /// Open a bucket for the window of `period` starting at `start`
    pub fn new(
        identity: Identity,
        period: Period,
        start: DateTime<Utc>,
        config: Arc<StatisticsConfig>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            identity,
            period,
            start,
            config,
            sink,
            state: BucketState::Open,
            counters: HashMap::new(),
            gauges: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Identity the bucket aggregates for
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Window length
    pub fn period(&self) -> Period {
        self.period
    }

    /// Window start
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Current state
    pub fn state(&self) -> BucketState {
        self.state
    }

    /// Whether the bucket has been closed
    pub fn is_closed(&self) -> bool {
        self.state == BucketState::Closed
    }

    /// Samples held for `metric` across all kinds
    pub fn population_size(&self, metric: &str) -> usize {
        [&self.counters, &self.gauges, &self.timers]
            .iter()
            .filter_map(|m| m.get(metric))
            .map(Vec::len)
            .sum()
    }

    /// Number of distinct (kind, metric) series held
    pub fn series_count(&self) -> usize {
        self.counters.len() + self.gauges.len() + self.timers.len()
    }

    fn samples_mut(&mut self, kind: MetricKind) -> &mut SampleMap {
        match kind {
            MetricKind::Counter => &mut self.counters,
            MetricKind::Gauge => &mut self.gauges,
            MetricKind::Timer => &mut self.timers,
        }
    }

    /// Kind a metric name was first seen under
    fn kind_of(&self, name: &str) -> Option<MetricKind> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| self.samples(*kind).contains_key(name))
    }

    fn samples(&self, kind: MetricKind) -> &SampleMap {
        match kind {
            MetricKind::Counter => &self.counters,
            MetricKind::Gauge => &self.gauges,
            MetricKind::Timer => &self.timers,
        }
    }

    /// Accumulate a record's samples
    ///
    /// Non-finite samples are discarded. A closed bucket rejects the record
    /// and logs it. A metric name keeps the kind it was first seen under;
    /// samples reported under another kind join that series.
    pub fn add(&mut self, record: &Record) -> AddOutcome {
        if self.is_closed() {
            warn!(
                identity = %self.identity,
                period = %self.period,
                start = %self.start,
                record_time = %record.time,
                "Record added after bucket close"
            );
            return AddOutcome::Rejected;
        }

        let mut accepted = 0;
        let mut discarded = 0;
        for (name, metric) in &record.metrics {
            let (valid, invalid): (Vec<Quantity>, Vec<Quantity>) =
                metric.values.iter().partition(|q| q.is_finite());
            discarded += invalid.len();
            if valid.is_empty() {
                continue;
            }
            let kind = match self.kind_of(name) {
                Some(existing) if existing != metric.kind => {
                    warn!(
                        identity = %self.identity,
                        metric = %name,
                        kind = metric.kind.as_str(),
                        existing = existing.as_str(),
                        "Metric reported under a second kind, keeping the first"
                    );
                    existing
                },
                _ => metric.kind,
            };
            accepted += valid.len();
            metrics::SAMPLES_ACCEPTED
                .with_label_values(&[kind.as_str()])
                .inc_by(valid.len() as f64);
            self.samples_mut(kind)
                .entry(name.clone())
                .or_default()
                .extend(valid);
        }
        if discarded > 0 {
            metrics::SAMPLES_DISCARDED
                .with_label_values(&["non_finite"])
                .inc_by(discarded as f64);
            debug!(identity = %self.identity, discarded, "Discarded non-finite samples");
        }
        AddOutcome::Added {
            accepted,
            discarded,
        }
    }

    /// Close the bucket and emit its aggregates
    ///
    /// Returns `false` if the bucket was already closed, in which case
    /// nothing is emitted.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            debug!(
                identity = %self.identity,
                period = %self.period,
                start = %self.start,
                "Ignoring close of closed bucket"
            );
            metrics::DUPLICATE_CLOSES
                .with_label_values(&[metrics::HOST_TIER])
                .inc();
            return false;
        }
        self.state = BucketState::Closed;

        let started = Instant::now();
        let mut data = Vec::new();
        for kind in MetricKind::ALL {
            let mut names: Vec<&String> = self.samples(kind).keys().collect();
            names.sort();
            for name in names {
                if let Some(samples) = self.samples(kind).get(name) {
                    self.compute_metric(name, kind, samples, &mut data);
                }
            }
        }

        debug!(
            identity = %self.identity,
            period = %self.period,
            start = %self.start,
            aggregates = data.len(),
            "Closing bucket"
        );
        let batch = PeriodicData::new(
            self.period,
            self.start,
            dimensions_for(
                &self.identity.cluster,
                &self.identity.service,
                &self.identity.host,
            ),
            data,
        );
        self.sink.record_aggregate_data(batch);

        // Samples are no longer needed once emitted
        self.counters = HashMap::new();
        self.gauges = HashMap::new();
        self.timers = HashMap::new();

        metrics::record_bucket_closed(
            metrics::HOST_TIER,
            &self.period.to_string(),
            started.elapsed().as_secs_f64(),
        );
        true
    }

    fn compute_metric(
        &self,
        name: &str,
        kind: MetricKind,
        samples: &[Quantity],
        out: &mut Vec<AggregatedData>,
    ) {
        let selection = self.config.selection_for(name, kind);
        let unified = match Quantity::unify(samples) {
            Ok(unified) => unified,
            Err(e) => {
                warn!(
                    identity = %self.identity,
                    metric = name,
                    error = %e,
                    "Skipping metric with incompatible samples"
                );
                metrics::record_statistic_error("unify");
                return;
            },
        };
        let population = unified.len() as i64;

        let order = selection.evaluation_order();
        let mut computed: HashMap<Statistic, CalculatedValue> = HashMap::with_capacity(order.len());
        for statistic in &order {
            match statistic.calculate_with(&unified, self.config.precision_bits(), &computed) {
                Ok(Some(value)) => {
                    computed.insert(*statistic, value);
                },
                Ok(None) => {
                    debug!(metric = name, statistic = %statistic, "No value for empty sample set");
                },
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        metric = name,
                        statistic = %statistic,
                        error = %e,
                        "Statistic computation failed"
                    );
                    metrics::record_statistic_error(&statistic.name());
                },
            }
        }

        for statistic in order {
            let Some(result) = computed.remove(&statistic) else {
                continue;
            };
            let fqdsn = Fqdsn::new(
                self.identity.cluster.clone(),
                self.identity.service.clone(),
                name,
                statistic,
            );
            out.push(
                AggregatedData::new(
                    fqdsn,
                    self.identity.host.clone(),
                    self.period,
                    self.start,
                    result.value,
                )
                .with_samples(unified.clone())
                .with_population_size(population)
                .specified(selection.is_specified(&statistic))
                .with_supporting_data(result.supporting_data),
            );
        }
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("identity", &self.identity)
            .field("period", &self.period)
            .field("start", &self.start)
            .field("state", &self.state)
            .field("series", &self.series_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Unit;
    use crate::sink::MemorySink;
    use crate::statistics::StatisticSelection;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_040, 0).unwrap()
    }

    fn bucket_with(config: StatisticsConfig) -> (Bucket, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let bucket = Bucket::new(
            Identity::new("cluster", "service", "host"),
            Period::from_secs(60).unwrap(),
            start(),
            Arc::new(config),
            sink.clone(),
        );
        (bucket, sink)
    }

    fn gauge(offset_secs: i64, value: f64) -> Record {
        Record::new(start() + Duration::seconds(offset_secs)).with_metric(
            "MyGauge",
            MetricKind::Gauge,
            [Quantity::unitless(value)],
        )
    }

    fn find<'a>(batch: &'a PeriodicData, statistic: Statistic) -> &'a AggregatedData {
        batch
            .data
            .iter()
            .find(|d| d.fqdsn().statistic == statistic)
            .unwrap()
    }

    #[test]
    fn test_min_with_dependent_count_and_sum() {
        let selection =
            StatisticSelection::with_dependent([Statistic::Min], [Statistic::Count, Statistic::Sum]);
        let (mut bucket, sink) = bucket_with(StatisticsConfig::from_selection(selection));
        bucket.add(&gauge(10, 2.0));
        bucket.add(&gauge(20, 1.0));
        bucket.add(&gauge(30, 3.0));
        assert!(bucket.close());

        let batches = sink.take();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.data.len(), 3);

        let min = find(batch, Statistic::Min);
        assert_eq!(min.value(), Quantity::unitless(1.0));
        assert!(min.is_specified());
        let sum = find(batch, Statistic::Sum);
        assert_eq!(sum.value(), Quantity::unitless(6.0));
        assert!(!sum.is_specified());
        let count = find(batch, Statistic::Count);
        assert_eq!(count.value(), Quantity::unitless(3.0));
        assert!(!count.is_specified());

        for data in &batch.data {
            assert_eq!(data.fqdsn().metric, "MyGauge");
            assert_eq!(data.period(), Period::from_secs(60).unwrap());
            assert_eq!(data.period_start(), start());
            assert_eq!(data.population_size(), 3);
            assert_eq!(
                data.samples(),
                &[
                    Quantity::unitless(2.0),
                    Quantity::unitless(1.0),
                    Quantity::unitless(3.0)
                ]
            );
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut bucket, sink) = bucket_with(StatisticsConfig::default());
        bucket.add(&gauge(1, 1.0));
        assert!(bucket.close());
        assert!(!bucket.close());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_add_after_close_rejected() {
        let (mut bucket, sink) = bucket_with(StatisticsConfig::default());
        bucket.close();
        assert_eq!(bucket.add(&gauge(1, 1.0)), AddOutcome::Rejected);
        assert_eq!(bucket.population_size("MyGauge"), 0);
        assert_eq!(sink.len(), 1);
        assert!(sink.take()[0].is_empty());
    }

    #[test]
    fn test_non_finite_samples_discarded() {
        let (mut bucket, _sink) = bucket_with(StatisticsConfig::default());
        let record = Record::new(start()).with_metric(
            "m",
            MetricKind::Counter,
            [
                Quantity::unitless(1.0),
                Quantity::unitless(f64::NAN),
                Quantity::unitless(f64::INFINITY),
            ],
        );
        assert_eq!(
            bucket.add(&record),
            AddOutcome::Added {
                accepted: 1,
                discarded: 2
            }
        );
        assert_eq!(bucket.population_size("m"), 1);
    }

    #[test]
    fn test_failing_metric_does_not_block_others() {
        let (mut bucket, sink) = bucket_with(StatisticsConfig::uniform([Statistic::Sum]));
        let record = Record::new(start())
            .with_metric(
                "mixed",
                MetricKind::Timer,
                [Quantity::unitless(1.0), Quantity::with_unit(1.0, Unit::Second)],
            )
            .with_metric("ok", MetricKind::Timer, [Quantity::unitless(4.0)]);
        bucket.add(&record);
        bucket.close();

        let batch = &sink.take()[0];
        assert_eq!(batch.data.len(), 1);
        assert_eq!(batch.data[0].fqdsn().metric, "ok");
    }

    #[test]
    fn test_samples_unified_to_smallest_unit() {
        let (mut bucket, sink) = bucket_with(StatisticsConfig::uniform([Statistic::Max]));
        let record = Record::new(start()).with_metric(
            "latency",
            MetricKind::Timer,
            [
                Quantity::with_unit(1.0, Unit::Second),
                Quantity::with_unit(20.0, Unit::Millisecond),
            ],
        );
        bucket.add(&record);
        bucket.close();

        let batch = &sink.take()[0];
        let max = find(batch, Statistic::Max);
        assert_eq!(max.value(), Quantity::with_unit(1000.0, Unit::Millisecond));
        assert!(max.samples().iter().all(|q| q.unit() == Some(Unit::Millisecond)));
    }

    #[test]
    fn test_kinds_use_their_own_statistics() {
        let (mut bucket, sink) = bucket_with(StatisticsConfig::new(
            [Statistic::Sum],
            [Statistic::Max],
            [Statistic::MEDIAN],
        ));
        let record = Record::new(start())
            .with_metric("c", MetricKind::Counter, [Quantity::unitless(1.0)])
            .with_metric("g", MetricKind::Gauge, [Quantity::unitless(1.0)])
            .with_metric("t", MetricKind::Timer, [Quantity::unitless(1.0)]);
        bucket.add(&record);
        bucket.close();

        let batch = &sink.take()[0];
        let specified: Vec<(String, Statistic)> = batch
            .specified()
            .map(|d| (d.fqdsn().metric.clone(), d.fqdsn().statistic))
            .collect();
        assert!(specified.contains(&("c".to_string(), Statistic::Sum)));
        assert!(specified.contains(&("g".to_string(), Statistic::Max)));
        assert!(specified.contains(&("t".to_string(), Statistic::MEDIAN)));
        assert_eq!(specified.len(), 3);
        // histogram rides along as a dependent of the median
        assert!(batch
            .data
            .iter()
            .any(|d| d.fqdsn().statistic == Statistic::Histogram && !d.is_specified()));
    }

    #[test]
    fn test_standalone_bucket_leaves_live_gauge_alone() {
        let sink = Arc::new(MemorySink::new());
        let period = Period::from_secs(43).unwrap();
        let mut bucket = Bucket::new(
            Identity::new("cluster", "service", "host"),
            period,
            start(),
            Arc::new(StatisticsConfig::default()),
            sink.clone(),
        );
        bucket.add(&gauge(1, 1.0));
        assert!(bucket.close());
        assert_eq!(sink.len(), 1);

        let live = metrics::LIVE_BUCKETS
            .with_label_values(&[metrics::HOST_TIER, &period.to_string()])
            .get();
        assert_eq!(live, 0.0);
    }

    #[test]
    fn test_metric_keeps_first_kind() {
        let (mut bucket, sink) = bucket_with(StatisticsConfig::uniform([Statistic::Count]));
        bucket.add(&Record::new(start()).with_metric(
            "x",
            MetricKind::Counter,
            [Quantity::unitless(1.0)],
        ));
        bucket.add(&Record::new(start()).with_metric(
            "x",
            MetricKind::Gauge,
            [Quantity::unitless(2.0)],
        ));
        assert_eq!(bucket.series_count(), 1);
        bucket.close();

        let batch = &sink.take()[0];
        assert_eq!(batch.data.len(), 1);
        let count = &batch.data[0];
        assert_eq!(count.fqdsn().metric, "x");
        assert_eq!(count.fqdsn().statistic, Statistic::Count);
        assert_eq!(count.value(), Quantity::unitless(2.0));
    }
}
