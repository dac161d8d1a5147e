//! Cluster tier: combine per-host statistic sets into cluster aggregates
//!
//! # Architecture
//!
//! ```text
//!   host aggregators ── StatisticSetRecord ──▶ ClusterAggregator::accept
//!                                                    │
//!                       DashMap<CombinedKey, Mutex<CombinedMetricData>>
//!                                                    │ housekeeping: rotate(now)
//!                                                    ▼
//!                   PeriodicData { host: "<cluster>-cluster<suffix>" } ──▶ Sink
//! ```
//!
//! Records are grouped by (cluster, service, metric, period, start). Merges
//! for one key are serialized by the key's mutex; different keys proceed in
//! parallel. A window is closed once `start + period + grace` has passed.
//! Records for a window that has already been emitted are dropped.

mod combined;
mod policy;

pub use combined::{
    CombinedKey, CombinedMetricData, CombinedStatistic, CombinedValue, MergeSummary,
};
pub use policy::PercentilePolicy;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics;
use crate::model::{
    dimensions_for, AggregatedData, Fqdsn, PeriodicData, StatisticSetRecord, UNKNOWN_POPULATION,
};
use crate::sink::Sink;

// ============================================================================
// Configuration
// ============================================================================

/// Settings of a [`ClusterAggregator`]
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Appended to `<cluster>-cluster` to form the emitted host name
    pub host_suffix: String,
    /// How long a window accepts host records after its end
    pub late_arrival_grace: Duration,
    /// Combination rule for percentiles
    pub percentile_policy: PercentilePolicy,
    /// Housekeeping tick
    pub housekeeping_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host_suffix: String::new(),
            late_arrival_grace: Duration::from_secs(60),
            percentile_policy: PercentilePolicy::default(),
            housekeeping_interval: Duration::from_millis(100),
        }
    }
}

impl ClusterConfig {
    /// Host name used for the cluster rows of `cluster`
    pub fn cluster_host(&self, cluster: &str) -> String {
        format!("{}-cluster{}", cluster, self.host_suffix)
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct ClusterStats {
    records_merged: AtomicU64,
    late_drops: AtomicU64,
    mismatched: AtomicU64,
    statistics_skipped: AtomicU64,
    windows_emitted: AtomicU64,
}

/// Snapshot of cluster aggregator statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatsSnapshot {
    /// Records merged into a window
    pub records_merged: u64,
    /// Records dropped because their window had been emitted
    pub late_drops: u64,
    /// Records refused by a window they did not belong to
    pub mismatched: u64,
    /// Statistic entries skipped during merges
    pub statistics_skipped: u64,
    /// Windows emitted
    pub windows_emitted: u64,
    /// Windows currently open
    pub live_windows: usize,
}

/// Result of [`ClusterAggregator::accept`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAcceptOutcome {
    /// Merged into its window
    Merged(MergeSummary),
    /// Window already emitted; dropped
    Late,
}

struct ClusterWindow {
    data: CombinedMetricData,
    emitted: bool,
}

// ============================================================================
// Cluster aggregator
// ============================================================================

/// Combines host statistic sets and emits cluster aggregates
pub struct ClusterAggregator {
    config: ClusterConfig,
    sink: Arc<dyn Sink>,
    windows: DashMap<CombinedKey, Arc<Mutex<ClusterWindow>>>,
    last_rotation_ms: AtomicI64,
    stats: ClusterStats,
    running: AtomicBool,
    shutdown_tx: RwLock<Option<mpsc::Sender<()>>>,
}

impl ClusterAggregator {
    /// Create a cluster aggregator emitting to `sink`
    pub fn new(config: ClusterConfig, sink: Arc<dyn Sink>) -> Self {
        Self {
            config,
            sink,
            windows: DashMap::new(),
            last_rotation_ms: AtomicI64::new(i64::MIN),
            stats: ClusterStats::default(),
            running: AtomicBool::new(false),
            shutdown_tx: RwLock::new(None),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn deadline_ms(&self, key: &CombinedKey) -> i64 {
        let grace = i64::try_from(self.config.late_arrival_grace.as_millis()).unwrap_or(i64::MAX);
        key.period_start
            .timestamp_millis()
            .saturating_add(key.period.as_millis())
            .saturating_add(grace)
    }

    /// Merge a host record using the current wall-clock time
    pub fn accept(&self, record: &StatisticSetRecord) -> Result<ClusterAcceptOutcome> {
        self.accept_at(record, Utc::now())
    }

    /// Merge a host record as if the current time were `now`
    ///
    /// # Errors
    ///
    /// `MismatchedRecord` only if the record's key disagrees with the window
    /// it was routed to, which indicates a bug in the caller's grouping.
    pub fn accept_at(
        &self,
        record: &StatisticSetRecord,
        now: DateTime<Utc>,
    ) -> Result<ClusterAcceptOutcome> {
        let key = CombinedKey::of(record);
        let deadline = self.deadline_ms(&key);
        if now.timestamp_millis() >= deadline {
            return Ok(self.late(record));
        }

        let window = match self.windows.entry(key) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                if deadline <= self.last_rotation_ms.load(Ordering::SeqCst) {
                    return Ok(self.late(record));
                }
                let window = Arc::new(Mutex::new(ClusterWindow {
                    data: CombinedMetricData::new(entry.key().clone()),
                    emitted: false,
                }));
                debug!(
                    cluster = %record.cluster,
                    service = %record.service,
                    metric = %record.metric,
                    period = %record.period,
                    start = %record.period_start,
                    "Opened cluster window"
                );
                metrics::record_bucket_created(metrics::CLUSTER_TIER, &record.period.to_string());
                entry.insert(Arc::clone(&window));
                window
            },
        };

        let mut guard = window.lock();
        if guard.emitted {
            return Ok(self.late(record));
        }
        let summary = match guard.data.merge(record) {
            Ok(summary) => summary,
            Err(e) => {
                self.stats.mismatched.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            },
        };
        drop(guard);

        self.stats.records_merged.fetch_add(1, Ordering::Relaxed);
        self.stats
            .statistics_skipped
            .fetch_add(summary.skipped as u64, Ordering::Relaxed);
        metrics::CLUSTER_RECORDS_MERGED
            .with_label_values(&[&record.period.to_string()])
            .inc();
        Ok(ClusterAcceptOutcome::Merged(summary))
    }

    fn late(&self, record: &StatisticSetRecord) -> ClusterAcceptOutcome {
        self.stats.late_drops.fetch_add(1, Ordering::Relaxed);
        metrics::record_late(metrics::CLUSTER_TIER, &record.period.to_string());
        warn!(
            cluster = %record.cluster,
            service = %record.service,
            metric = %record.metric,
            host = %record.host,
            start = %record.period_start,
            "Dropping late statistic set"
        );
        ClusterAcceptOutcome::Late
    }

    /// Emit every window whose deadline is at or before `now`
    pub fn rotate(&self, now: DateTime<Utc>) -> usize {
        self.rotate_ms(now.timestamp_millis())
    }

    /// Emit every open window and refuse new ones
    pub fn close_all(&self) -> usize {
        let emitted = self.rotate_ms(i64::MAX);
        info!(emitted, "Emitted all open cluster windows");
        emitted
    }

    fn rotate_ms(&self, now_ms: i64) -> usize {
        self.last_rotation_ms.fetch_max(now_ms, Ordering::SeqCst);
        let expired: Vec<CombinedKey> = self
            .windows
            .iter()
            .filter(|entry| self.deadline_ms(entry.key()) <= now_ms)
            .map(|entry| entry.key().clone())
            .collect();

        let mut emitted = 0;
        for key in expired {
            let Some((_, window)) = self.windows.remove(&key) else {
                continue;
            };
            metrics::record_bucket_removed(metrics::CLUSTER_TIER, &key.period.to_string());
            let mut guard = window.lock();
            if guard.emitted {
                metrics::DUPLICATE_CLOSES
                    .with_label_values(&[metrics::CLUSTER_TIER])
                    .inc();
                continue;
            }
            guard.emitted = true;
            self.emit(&guard.data);
            emitted += 1;
        }
        if emitted > 0 {
            self.stats
                .windows_emitted
                .fetch_add(emitted as u64, Ordering::Relaxed);
        }
        emitted
    }

    fn emit(&self, data: &CombinedMetricData) {
        let started = Instant::now();
        let key = data.key();
        let host = self.config.cluster_host(&key.cluster);
        let population = data
            .merged_count()
            .map(|c| c as i64)
            .unwrap_or(UNKNOWN_POPULATION);

        let aggregates: Vec<AggregatedData> = data
            .compute(self.config.percentile_policy)
            .into_iter()
            .map(|combined| {
                AggregatedData::new(
                    Fqdsn::new(
                        key.cluster.clone(),
                        key.service.clone(),
                        key.metric.clone(),
                        combined.statistic,
                    ),
                    host.clone(),
                    key.period,
                    key.period_start,
                    combined.value.value,
                )
                .with_population_size(population)
                .specified(combined.user_specified)
                .with_supporting_data(combined.value.supporting_data)
            })
            .collect();

        if aggregates.is_empty() {
            error!(
                cluster = %key.cluster,
                service = %key.service,
                metric = %key.metric,
                hosts = data.hosts().len(),
                "Cluster window produced no aggregates"
            );
        } else {
            debug!(
                cluster = %key.cluster,
                metric = %key.metric,
                hosts = data.hosts().len(),
                aggregates = aggregates.len(),
                "Emitting cluster window"
            );
        }

        self.sink.record_aggregate_data(PeriodicData::new(
            key.period,
            key.period_start,
            dimensions_for(&key.cluster, &key.service, &host),
            aggregates,
        ));
        metrics::record_bucket_closed(
            metrics::CLUSTER_TIER,
            &key.period.to_string(),
            started.elapsed().as_secs_f64(),
        );
    }

    /// Number of windows currently open
    pub fn live_windows(&self) -> usize {
        self.windows.len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ClusterStatsSnapshot {
        ClusterStatsSnapshot {
            records_merged: self.stats.records_merged.load(Ordering::Relaxed),
            late_drops: self.stats.late_drops.load(Ordering::Relaxed),
            mismatched: self.stats.mismatched.load(Ordering::Relaxed),
            statistics_skipped: self.stats.statistics_skipped.load(Ordering::Relaxed),
            windows_emitted: self.stats.windows_emitted.load(Ordering::Relaxed),
            live_windows: self.live_windows(),
        }
    }

    /// Start the housekeeping task
    pub async fn start_housekeeping(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Cluster housekeeping already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let aggregator = Arc::clone(&self);
        let tick = self.config.housekeeping_interval.max(Duration::from_millis(1));

        info!(
            housekeeping_interval_ms = tick.as_millis() as u64,
            grace_ms = self.config.late_arrival_grace.as_millis() as u64,
            policy = %self.config.percentile_policy,
            "Starting cluster housekeeping"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Cluster housekeeping shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        aggregator.rotate(Utc::now());
                    }
                }
            }

            aggregator.running.store(false, Ordering::SeqCst);
            info!("Cluster housekeeping stopped");
        });
    }

    /// Stop the housekeeping task
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Whether the housekeeping task is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Host aggregators can emit straight into a cluster aggregator
impl Sink for ClusterAggregator {
    fn record_aggregate_data(&self, batch: PeriodicData) {
        let records = match StatisticSetRecord::from_periodic_data(&batch) {
            Ok(records) => records,
            Err(e) => {
                error!(period = %batch.period, start = %batch.start, error = %e, "Failed to export batch");
                return;
            },
        };
        for record in &records {
            if let Err(e) = self.accept(record) {
                error!(metric = %record.metric, host = %record.host, error = %e, "Failed to merge statistic set");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Period, StatisticRecord};
    use crate::sink::MemorySink;
    use crate::statistics::Statistic;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn record(host: &str, count: f64) -> StatisticSetRecord {
        StatisticSetRecord {
            cluster: "prod".to_string(),
            service: "api".to_string(),
            metric: "requests".to_string(),
            host: host.to_string(),
            period: Period::from_secs(60).unwrap(),
            period_start: at(0),
            statistics: vec![StatisticRecord {
                statistic: "count".to_string(),
                value: count,
                unit: None,
                supporting_data: None,
                user_specified: true,
            }],
        }
    }

    fn aggregator(suffix: &str) -> (ClusterAggregator, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config = ClusterConfig {
            host_suffix: suffix.to_string(),
            late_arrival_grace: Duration::from_secs(10),
            ..Default::default()
        };
        (ClusterAggregator::new(config, sink.clone()), sink)
    }

    #[test]
    fn test_emits_cluster_row() {
        let (agg, sink) = aggregator("-east");
        agg.accept_at(&record("a", 3.0), at(1_000)).unwrap();
        agg.accept_at(&record("b", 2.0), at(2_000)).unwrap();
        assert_eq!(agg.live_windows(), 1);

        assert_eq!(agg.rotate(at(69_999)), 0);
        assert_eq!(agg.rotate(at(70_000)), 1);

        let batch = &sink.take()[0];
        assert_eq!(batch.dimension("host"), Some("prod-cluster-east"));
        let count = &batch.data[0];
        assert_eq!(count.fqdsn().statistic, Statistic::Count);
        assert_eq!(count.value().value(), 5.0);
        assert_eq!(count.population_size(), 5);
        assert_eq!(count.host(), "prod-cluster-east");
        assert!(count.is_specified());
    }

    #[test]
    fn test_late_after_emit() {
        let (agg, sink) = aggregator("");
        agg.accept_at(&record("a", 1.0), at(1_000)).unwrap();
        agg.rotate(at(70_000));
        // clock skew: the window was already emitted
        assert_eq!(
            agg.accept_at(&record("b", 1.0), at(65_000)).unwrap(),
            ClusterAcceptOutcome::Late
        );
        assert_eq!(agg.stats().late_drops, 1);
        assert_eq!(agg.stats().windows_emitted, 1);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_duplicate_delivery_not_double_counted() {
        let (agg, sink) = aggregator("");
        agg.accept_at(&record("a", 3.0), at(1_000)).unwrap();
        agg.accept_at(&record("a", 3.0), at(1_500)).unwrap();
        agg.close_all();
        assert_eq!(sink.take()[0].data[0].value().value(), 3.0);
    }

    #[test]
    fn test_population_unknown_without_count() {
        let (agg, sink) = aggregator("");
        let mut r = record("a", 1.0);
        r.statistics[0].statistic = "max".to_string();
        agg.accept_at(&r, at(0)).unwrap();
        agg.close_all();
        assert_eq!(sink.take()[0].data[0].population_size(), UNKNOWN_POPULATION);
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let (agg, _) = aggregator("");
        agg.stop().await;
        assert!(!agg.is_running());
    }
}
