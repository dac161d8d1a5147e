//! Prometheus metrics for the aggregation engine
//!
//! Counters cover the ingestion path (records, samples, late drops), bucket
//! lifecycle, statistic failures, the cluster tier and the handoff buffer.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Ingestion ===

    /// Records accepted by an aggregator, by period
    pub static ref RECORDS_ACCEPTED: CounterVec = register_counter_vec!(
        "tsdagg_records_accepted_total",
        "Records routed into at least one bucket",
        &["period"]
    ).unwrap();

    /// Samples added to buckets, by metric kind
    pub static ref SAMPLES_ACCEPTED: CounterVec = register_counter_vec!(
        "tsdagg_samples_accepted_total",
        "Samples accumulated into buckets",
        &["kind"]
    ).unwrap();

    /// Samples discarded because their value was not finite
    pub static ref SAMPLES_DISCARDED: CounterVec = register_counter_vec!(
        "tsdagg_samples_discarded_total",
        "Samples discarded at ingestion",
        &["reason"]
    ).unwrap();

    /// Records dropped because their window had already closed
    pub static ref LATE_RECORDS: CounterVec = register_counter_vec!(
        "tsdagg_late_records_total",
        "Records dropped after their window closed",
        &["tier", "period"]
    ).unwrap();

    // === Bucket lifecycle ===

    /// Buckets opened
    pub static ref BUCKETS_CREATED: CounterVec = register_counter_vec!(
        "tsdagg_buckets_created_total",
        "Buckets opened",
        &["tier", "period"]
    ).unwrap();

    /// Buckets closed and emitted
    pub static ref BUCKETS_CLOSED: CounterVec = register_counter_vec!(
        "tsdagg_buckets_closed_total",
        "Buckets closed and emitted",
        &["tier", "period"]
    ).unwrap();

    /// Close calls on an already-closed bucket
    pub static ref DUPLICATE_CLOSES: CounterVec = register_counter_vec!(
        "tsdagg_duplicate_closes_total",
        "Ignored close calls on closed buckets",
        &["tier"]
    ).unwrap();

    /// Buckets currently open
    pub static ref LIVE_BUCKETS: GaugeVec = register_gauge_vec!(
        "tsdagg_live_buckets",
        "Buckets currently open",
        &["tier", "period"]
    ).unwrap();

    /// Bucket close latency
    pub static ref CLOSE_DURATION: HistogramVec = register_histogram_vec!(
        "tsdagg_bucket_close_seconds",
        "Time spent computing and emitting a bucket",
        &["tier"],
        vec![0.0001, 0.001, 0.01, 0.1, 1.0]
    ).unwrap();

    // === Errors ===

    /// Statistic computations that failed, by statistic
    pub static ref STATISTIC_ERRORS: CounterVec = register_counter_vec!(
        "tsdagg_statistic_errors_total",
        "Statistic computations that failed",
        &["statistic"]
    ).unwrap();

    /// Unknown statistic names skipped at the cluster boundary
    pub static ref UNKNOWN_STATISTICS: CounterVec = register_counter_vec!(
        "tsdagg_unknown_statistics_total",
        "Unknown statistic names skipped",
        &["statistic"]
    ).unwrap();

    /// Aggregates dropped by unification
    pub static ref UNIFICATION_FAILURES: CounterVec = register_counter_vec!(
        "tsdagg_unification_failures_total",
        "Aggregates dropped because value and samples could not share a unit",
        &["statistic"]
    ).unwrap();

    // === Cluster tier ===

    /// Statistic set records merged
    pub static ref CLUSTER_RECORDS_MERGED: CounterVec = register_counter_vec!(
        "tsdagg_cluster_records_merged_total",
        "Statistic set records merged into cluster buckets",
        &["period"]
    ).unwrap();

    // === Handoff ===

    /// Items dropped from a full handoff buffer
    pub static ref HANDOFF_DROPS: CounterVec = register_counter_vec!(
        "tsdagg_handoff_dropped_total",
        "Items dropped from a full handoff buffer",
        &["proxy"]
    ).unwrap();
}

/// Tier label for per-host aggregation
pub const HOST_TIER: &str = "host";
/// Tier label for cluster combination
pub const CLUSTER_TIER: &str = "cluster";

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record a late drop
#[inline]
pub fn record_late(tier: &str, period: &str) {
    LATE_RECORDS.with_label_values(&[tier, period]).inc();
}

/// Record a bucket being opened
#[inline]
pub fn record_bucket_created(tier: &str, period: &str) {
    BUCKETS_CREATED.with_label_values(&[tier, period]).inc();
    LIVE_BUCKETS.with_label_values(&[tier, period]).inc();
}

/// Record a bucket leaving its aggregator's live set
#[inline]
pub fn record_bucket_removed(tier: &str, period: &str) {
    LIVE_BUCKETS.with_label_values(&[tier, period]).dec();
}

/// Record a bucket being closed
#[inline]
pub fn record_bucket_closed(tier: &str, period: &str, duration_secs: f64) {
    BUCKETS_CLOSED.with_label_values(&[tier, period]).inc();
    CLOSE_DURATION.with_label_values(&[tier]).observe(duration_secs);
}

/// Record a statistic computation failure
#[inline]
pub fn record_statistic_error(statistic: &str) {
    STATISTIC_ERRORS.with_label_values(&[statistic]).inc();
}
