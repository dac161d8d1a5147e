//! Sink boundary for finished aggregates
//!
//! Buckets hand a [`PeriodicData`] batch to a [`Sink`] and return
//! immediately. Whatever the sink does with it (write to disk, publish,
//! forward to the cluster tier) happens on the sink's side; a sink must not
//! block the caller on external I/O.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::model::PeriodicData;

/// Consumer of closed-window batches
pub trait Sink: Send + Sync {
    /// Accept a batch. Must not block on external side effects.
    fn record_aggregate_data(&self, data: PeriodicData);

    /// Flush and release resources
    fn close(&self) {}
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn record_aggregate_data(&self, data: PeriodicData) {
        (**self).record_aggregate_data(data)
    }

    fn close(&self) {
        (**self).close()
    }
}

/// Forwards batches into a bounded tokio channel
///
/// A full channel drops the batch with a warning rather than blocking the
/// closing bucket.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<PeriodicData>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PeriodicData>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl Sink for ChannelSink {
    fn record_aggregate_data(&self, data: PeriodicData) {
        match self.sender.try_send(data) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(batch)) => {
                warn!(
                    period = %batch.period,
                    start = %batch.start,
                    aggregates = batch.len(),
                    "Sink channel full, dropping batch"
                );
            },
            Err(mpsc::error::TrySendError::Closed(batch)) => {
                error!(
                    period = %batch.period,
                    start = %batch.start,
                    "Sink channel closed, dropping batch"
                );
            },
        }
    }
}

/// Keeps every batch in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<PeriodicData>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<PeriodicData> {
        std::mem::take(&mut *self.batches.lock())
    }

    /// Copy of everything recorded so far
    pub fn snapshot(&self) -> Vec<PeriodicData> {
        self.batches.lock().clone()
    }

    /// Number of batches recorded
    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

impl Sink for MemorySink {
    fn record_aggregate_data(&self, data: PeriodicData) {
        self.batches.lock().push(data);
    }
}

/// Sends every batch to several sinks
pub struct MultiSink {
    sinks: Vec<Arc<dyn Sink>>,
}

impl MultiSink {
    /// Fan out to `sinks`
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }
}

impl Sink for MultiSink {
    fn record_aggregate_data(&self, data: PeriodicData) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record_aggregate_data(data.clone());
            }
            last.record_aggregate_data(data);
        }
    }

    fn close(&self) {
        for sink in &self.sinks {
            sink.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{dimensions_for, Period};
    use chrono::{TimeZone, Utc};

    fn batch() -> PeriodicData {
        PeriodicData::new(
            Period::from_secs(1).unwrap(),
            Utc.timestamp_opt(0, 0).unwrap(),
            dimensions_for("c", "s", "h"),
            Vec::new(),
        )
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.record_aggregate_data(batch());
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.take().len(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.record_aggregate_data(batch());
        sink.record_aggregate_data(batch());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_multi_sink_fans_out() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let multi = MultiSink::new(vec![a.clone() as Arc<dyn Sink>, b.clone()]);
        multi.record_aggregate_data(batch());
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
