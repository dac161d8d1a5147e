//! tsd-aggregator - time-windowed metrics aggregation
//!
//! This library turns streams of timestamped, unit-aware samples into
//! per-period summary statistics and merges per-host summaries into
//! cluster-wide ones:
//! - Unit-aware quantities with conversion inside a physical domain
//! - Buckets per (identity, period, start) closed after a grace period
//! - Count, sum, mean, min, max, percentiles and mergeable histograms
//! - Cluster-tier combination with at-least-once safe merging
//!
//! ```text
//!  Record ──▶ Aggregator ──▶ Bucket::close ──▶ Sink (PeriodicData)
//!                                                │ StatisticSetRecord
//!                                                ▼
//!                                       ClusterAggregator ──▶ Sink
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod model;
pub mod statistics;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Tracing subscriber initialisation
pub mod logging;

/// Per-window accumulation of samples
pub mod bucket;

/// Routing of records into windows and housekeeping
pub mod aggregator;

/// Destinations for finished aggregates
pub mod sink;

/// Value/sample unit unification
pub mod unifier;

/// Cross-host combination of statistic sets
pub mod cluster;

/// Buffering handoff between handler generations
pub mod handoff;

// Re-export main types
pub use aggregator::{AcceptOutcome, Aggregator, AggregatorConfig, AggregatorStatsSnapshot};
pub use bucket::{AddOutcome, Bucket, BucketState};
pub use cluster::{ClusterAggregator, ClusterConfig, CombinedMetricData, PercentilePolicy};
pub use error::{Error, Result};
pub use handoff::{Handler, HandoffProxy, HandoffState};
pub use model::{
    AggregatedData, Fqdsn, Identity, MetricKind, Period, PeriodicData, Quantity, Record,
    StatisticSetRecord, Unit,
};
pub use sink::{ChannelSink, MemorySink, MultiSink, Sink};
pub use statistics::{Statistic, StatisticFactory, StatisticsConfig};
