//! Routing of records into windowed buckets
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Aggregator                             │
//! │                                                                  │
//! │  accept(record) ──┬──▶ PeriodCloser(PT1S) ── DashMap<key,Bucket> │
//! │                   └──▶ PeriodCloser(PT1M) ── DashMap<key,Bucket> │
//! │                                   ▲                              │
//! │  housekeeping task ── interval ───┘ rotate(now): close expired   │
//! │                                                                  │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                ▼
//!                      Sink::record_aggregate_data
//! ```
//!
//! Each record is routed into one bucket per configured period. A bucket
//! stays open until `start + period + grace`; the housekeeping task closes
//! it after that and records that arrive later are dropped and counted.
//!
//! The bucket maps are shared between ingestion and housekeeping. Each
//! bucket sits behind its own mutex, so work on different buckets proceeds
//! in parallel while adds and the close of one bucket are serialized.

mod closer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::bucket::AddOutcome;
use crate::metrics;
use crate::model::{Identity, Period, Record};
use crate::sink::Sink;
use crate::statistics::StatisticsConfig;

use closer::{PeriodCloser, Routed};

// ============================================================================
// Configuration
// ============================================================================

/// Runtime settings of an [`Aggregator`]
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Identity assigned to records that carry none
    pub identity: Identity,
    /// Window lengths tracked concurrently
    pub periods: Vec<Period>,
    /// How long a window stays open after its end; `None` uses
    /// `min(period / 2, 10 minutes)` per period
    pub late_arrival_grace: Option<Duration>,
    /// Housekeeping tick
    pub housekeeping_interval: Duration,
    /// Statistics per metric kind
    pub statistics: Arc<StatisticsConfig>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            identity: Identity::new("default", "default", "localhost"),
            periods: default_periods(),
            late_arrival_grace: None,
            housekeeping_interval: Duration::from_millis(100),
            statistics: Arc::new(StatisticsConfig::default()),
        }
    }
}

fn default_periods() -> Vec<Period> {
    [1_000, 60_000]
        .into_iter()
        .filter_map(|ms| Period::from_millis(ms).ok())
        .collect()
}

impl AggregatorConfig {
    /// Grace applied to windows of `period`
    pub fn grace_for(&self, period: Period) -> Duration {
        self.late_arrival_grace
            .unwrap_or_else(|| period.default_grace())
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct AggregatorStats {
    records_accepted: AtomicU64,
    late_drops: AtomicU64,
    buckets_created: AtomicU64,
    buckets_closed: AtomicU64,
    samples_discarded: AtomicU64,
}

/// Snapshot of aggregator statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorStatsSnapshot {
    /// Records routed into at least one bucket
    pub records_accepted: u64,
    /// (record, period) pairs dropped because the window had closed
    pub late_drops: u64,
    /// Buckets opened
    pub buckets_created: u64,
    /// Buckets closed and emitted
    pub buckets_closed: u64,
    /// Non-finite samples discarded
    pub samples_discarded: u64,
    /// Buckets currently open
    pub live_buckets: usize,
}

/// Result of [`Aggregator::accept`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceptOutcome {
    /// Periods the record was added to
    pub accepted: usize,
    /// Periods whose window had already closed
    pub late: usize,
}

impl AcceptOutcome {
    /// Whether the record was dropped for every period
    pub fn is_dropped(&self) -> bool {
        self.accepted == 0
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Owns the live buckets of every configured period
pub struct Aggregator {
    config: AggregatorConfig,
    closers: Vec<PeriodCloser>,
    sink: Arc<dyn Sink>,
    stats: AggregatorStats,
    running: AtomicBool,
    shutdown_tx: RwLock<Option<mpsc::Sender<()>>>,
}

impl Aggregator {
    /// Create an aggregator emitting to `sink`
    pub fn new(config: AggregatorConfig, sink: Arc<dyn Sink>) -> Self {
        let mut periods = config.periods.clone();
        periods.sort();
        periods.dedup();
        let closers = periods
            .into_iter()
            .map(|period| PeriodCloser::new(period, config.grace_for(period)))
            .collect();
        Self {
            config,
            closers,
            sink,
            stats: AggregatorStats::default(),
            running: AtomicBool::new(false),
            shutdown_tx: RwLock::new(None),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Tracked periods, shortest first
    pub fn periods(&self) -> Vec<Period> {
        self.closers.iter().map(|c| c.period()).collect()
    }

    /// Route a record using the current wall-clock time
    pub fn accept(&self, record: &Record) -> AcceptOutcome {
        self.accept_at(record, Utc::now())
    }

    /// Route a record as if the current time were `now`
    pub fn accept_at(&self, record: &Record, now: DateTime<Utc>) -> AcceptOutcome {
        let identity = record.identity.as_ref().unwrap_or(&self.config.identity);
        let mut outcome = AcceptOutcome::default();
        for closer in &self.closers {
            let added = match closer.route(record, identity, now, &self.config.statistics, &self.sink)
            {
                Routed::Late => {
                    outcome.late += 1;
                    self.stats.late_drops.fetch_add(1, Ordering::Relaxed);
                    metrics::record_late(metrics::HOST_TIER, closer.label());
                    warn!(
                        identity = %identity,
                        period = closer.label(),
                        record_time = %record.time,
                        now = %now,
                        "Dropping late record"
                    );
                    continue;
                },
                Routed::Created(added) => {
                    self.stats.buckets_created.fetch_add(1, Ordering::Relaxed);
                    added
                },
                Routed::Existing(added) => added,
            };
            if let AddOutcome::Added { discarded, .. } = added {
                self.stats
                    .samples_discarded
                    .fetch_add(discarded as u64, Ordering::Relaxed);
            }
            outcome.accepted += 1;
            metrics::RECORDS_ACCEPTED
                .with_label_values(&[closer.label()])
                .inc();
        }
        if outcome.accepted > 0 {
            self.stats.records_accepted.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Close buckets whose deadline has passed as of `now`
    pub fn rotate(&self, now: DateTime<Utc>) -> usize {
        let now_ms = now.timestamp_millis();
        let closed: usize = self.closers.iter().map(|c| c.rotate(now_ms)).sum();
        if closed > 0 {
            self.stats
                .buckets_closed
                .fetch_add(closed as u64, Ordering::Relaxed);
            debug!(closed, "Rotated expired buckets");
        }
        closed
    }

    /// Close every open bucket regardless of its deadline
    ///
    /// Used on shutdown and when handing traffic to a replacement
    /// aggregator. Windows closed this way are not reopened; later records
    /// for them are dropped as late.
    pub fn close_all(&self) -> usize {
        let closed: usize = self.closers.iter().map(|c| c.close_all()).sum();
        self.stats
            .buckets_closed
            .fetch_add(closed as u64, Ordering::Relaxed);
        info!(closed, "Closed all open buckets");
        closed
    }

    /// Number of buckets currently open
    pub fn live_buckets(&self) -> usize {
        self.closers.iter().map(|c| c.live_buckets()).sum()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            records_accepted: self.stats.records_accepted.load(Ordering::Relaxed),
            late_drops: self.stats.late_drops.load(Ordering::Relaxed),
            buckets_created: self.stats.buckets_created.load(Ordering::Relaxed),
            buckets_closed: self.stats.buckets_closed.load(Ordering::Relaxed),
            samples_discarded: self.stats.samples_discarded.load(Ordering::Relaxed),
            live_buckets: self.live_buckets(),
        }
    }

    /// Start the housekeeping task
    ///
    /// Spawns a tokio task that calls [`rotate`](Self::rotate) every
    /// `housekeeping_interval`. Runs until [`stop`](Self::stop).
    pub async fn start_housekeeping(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Aggregator housekeeping already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let aggregator = Arc::clone(&self);
        let tick = self.config.housekeeping_interval.max(Duration::from_millis(1));

        info!(
            housekeeping_interval_ms = tick.as_millis() as u64,
            periods = ?self.closers.iter().map(|c| c.label().to_string()).collect::<Vec<_>>(),
            grace_ms = ?self.closers.iter().map(|c| c.grace_ms()).collect::<Vec<_>>(),
            "Starting aggregator housekeeping"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Aggregator housekeeping shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        aggregator.rotate(Utc::now());
                    }
                }
            }

            aggregator.running.store(false, Ordering::SeqCst);
            info!("Aggregator housekeeping stopped");
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
