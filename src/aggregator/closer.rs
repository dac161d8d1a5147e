//! Live buckets of one period length

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::bucket::{AddOutcome, Bucket};
use crate::metrics;
use crate::model::{Identity, Period, Record};
use crate::sink::Sink;
use crate::statistics::StatisticsConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    identity: Identity,
    start_ms: i64,
}

/// Outcome of routing a record into one period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    /// Added to an existing bucket
    Existing(AddOutcome),
    /// Added to a bucket opened for it
    Created(AddOutcome),
    /// Window already closed
    Late,
}

/// Buckets for one period length, keyed by identity and window start
///
/// A window's deadline is `start + period + grace`. Ingestion never opens a
/// bucket whose deadline is at or before the last rotation time, so once a
/// window has been rotated out it cannot be recreated.
pub(crate) struct PeriodCloser {
    period: Period,
    label: String,
    grace_ms: i64,
    buckets: DashMap<BucketKey, Arc<Mutex<Bucket>>>,
    last_rotation_ms: AtomicI64,
}

impl PeriodCloser {
    pub(crate) fn new(period: Period, grace: std::time::Duration) -> Self {
        Self {
            period,
            label: period.to_string(),
            grace_ms: i64::try_from(grace.as_millis()).unwrap_or(i64::MAX),
            buckets: DashMap::new(),
            last_rotation_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub(crate) fn period(&self) -> Period {
        self.period
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn grace_ms(&self) -> i64 {
        self.grace_ms
    }

    pub(crate) fn live_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn deadline_ms(&self, start_ms: i64) -> i64 {
        start_ms
            .saturating_add(self.period.as_millis())
            .saturating_add(self.grace_ms)
    }

    pub(crate) fn route(
        &self,
        record: &Record,
        identity: &Identity,
        now: DateTime<Utc>,
        config: &Arc<StatisticsConfig>,
        sink: &Arc<dyn Sink>,
    ) -> Routed {
        let start = self.period.start_of(record.time);
        let start_ms = start.timestamp_millis();
        let deadline = self.deadline_ms(start_ms);
        if now.timestamp_millis() >= deadline {
            return Routed::Late;
        }

        let key = BucketKey {
            identity: identity.clone(),
            start_ms,
        };
        let (bucket, created) = match self.buckets.entry(key) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                // Checked under the shard lock so a concurrent rotation either
                // sees this bucket or prevents its creation
                if deadline <= self.last_rotation_ms.load(Ordering::SeqCst) {
                    return Routed::Late;
                }
                let bucket = Arc::new(Mutex::new(Bucket::new(
                    identity.clone(),
                    self.period,
                    start,
                    Arc::clone(config),
                    Arc::clone(sink),
                )));
                entry.insert(Arc::clone(&bucket));
                debug!(identity = %identity, period = %self.label, start = %start, "Opened bucket");
                metrics::record_bucket_created(metrics::HOST_TIER, &self.label);
                (bucket, true)
            },
        };

        let outcome = bucket.lock().add(record);
        match outcome {
            AddOutcome::Rejected => Routed::Late,
            added if created => Routed::Created(added),
            added => Routed::Existing(added),
        }
    }

    /// Close every bucket whose deadline is at or before `now`
    pub(crate) fn rotate(&self, now_ms: i64) -> usize {
        self.last_rotation_ms.fetch_max(now_ms, Ordering::SeqCst);
        let expired: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|entry| self.deadline_ms(entry.key().start_ms) <= now_ms)
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for key in expired {
            if let Some((_, bucket)) = self.buckets.remove(&key) {
                metrics::record_bucket_removed(metrics::HOST_TIER, &self.label);
                if bucket.lock().close() {
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Close every live bucket and refuse new ones
    pub(crate) fn close_all(&self) -> usize {
        self.rotate(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricKind, Quantity};
    use crate::sink::MemorySink;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn record(ms: i64) -> Record {
        Record::new(at(ms)).with_metric("m", MetricKind::Counter, [Quantity::unitless(1.0)])
    }

    fn setup() -> (PeriodCloser, Arc<StatisticsConfig>, Arc<dyn Sink>, Arc<MemorySink>) {
        let memory = Arc::new(MemorySink::new());
        let sink: Arc<dyn Sink> = memory.clone();
        (
            PeriodCloser::new(Period::from_secs(60).unwrap(), Duration::from_secs(30)),
            Arc::new(StatisticsConfig::default()),
            sink,
            memory,
        )
    }

    #[test]
    fn test_route_creates_then_reuses() {
        let (closer, config, sink, _) = setup();
        let id = Identity::new("c", "s", "h");
        assert!(matches!(
            closer.route(&record(1_000), &id, at(1_000), &config, &sink),
            Routed::Created(_)
        ));
        assert!(matches!(
            closer.route(&record(59_000), &id, at(59_000), &config, &sink),
            Routed::Existing(_)
        ));
        assert_eq!(closer.live_buckets(), 1);
    }

    #[test]
    fn test_deadline_includes_grace() {
        let (closer, config, sink, memory) = setup();
        let id = Identity::new("c", "s", "h");
        closer.route(&record(1_000), &id, at(1_000), &config, &sink);

        // window [0, 60s) plus 30s grace
        assert_eq!(closer.rotate(89_999), 0);
        assert_eq!(
            closer.route(&record(2_000), &id, at(89_999), &config, &sink),
            Routed::Existing(AddOutcome::Added {
                accepted: 1,
                discarded: 0
            })
        );
        assert_eq!(closer.rotate(90_000), 1);
        assert_eq!(memory.len(), 1);
        assert_eq!(closer.live_buckets(), 0);
    }

    #[test]
    fn test_rotated_window_is_not_reopened() {
        let (closer, config, sink, memory) = setup();
        let id = Identity::new("c", "s", "h");
        closer.rotate(90_000);
        // a clock behind the rotation must still not reopen the window
        assert_eq!(
            closer.route(&record(1_000), &id, at(80_000), &config, &sink),
            Routed::Late
        );
        assert_eq!(closer.live_buckets(), 0);
        assert!(memory.is_empty());
    }

    #[test]
    fn test_close_all() {
        let (closer, config, sink, memory) = setup();
        closer.route(&record(1_000), &Identity::new("c", "s", "a"), at(1_000), &config, &sink);
        closer.route(&record(1_000), &Identity::new("c", "s", "b"), at(1_000), &config, &sink);
        assert_eq!(closer.close_all(), 2);
        assert_eq!(memory.len(), 2);
        assert_eq!(
            closer.route(&record(1_000), &Identity::new("c", "s", "a"), at(1_000), &config, &sink),
            Routed::Late
        );
    }

    #[test]
    fn test_live_bucket_gauge_follows_map() {
        let memory = Arc::new(MemorySink::new());
        let sink: Arc<dyn Sink> = memory.clone();
        let config = Arc::new(StatisticsConfig::default());
        let closer = PeriodCloser::new(Period::from_secs(41).unwrap(), Duration::ZERO);
        let live = || {
            metrics::LIVE_BUCKETS
                .with_label_values(&[metrics::HOST_TIER, closer.label()])
                .get()
        };

        closer.route(&record(1_000), &Identity::new("c", "s", "a"), at(1_000), &config, &sink);
        closer.route(&record(1_000), &Identity::new("c", "s", "b"), at(1_000), &config, &sink);
        assert_eq!(live(), 2.0);
        assert_eq!(closer.close_all(), 2);
        assert_eq!(live(), 0.0);
    }
}
