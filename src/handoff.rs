//! Handoff between an old and a new handler on reconfiguration
//!
//! ```text
//!            apply_config()                      replay done
//!   Idle ────────────────────▶ Starting ─────────────────────▶ Running
//!                                 ▲                               │
//!                                 │        apply_config()         │
//!                                 └────────── Draining ◀──────────┘
//! ```
//!
//! While not `Running`, incoming messages are queued in a bounded buffer.
//! When the buffer is full the oldest message is dropped with a warning.
//! Once the new handler is built the buffer is replayed to it in arrival
//! order, then the proxy switches to direct delivery.
//!
//! Direct deliveries hold a read guard on the delivery lock for the whole
//! `handle` call. Retiring a handler takes the write guard, so a handler is
//! never drained while a message is still being handed to it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::cluster::ClusterAggregator;
use crate::error::Result;
use crate::metrics;
use crate::model::{Record, StatisticSetRecord};

/// Default number of messages buffered during a handoff
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Message consumer that can be swapped out by a [`HandoffProxy`]
pub trait Handler: Send + Sync {
    /// Message type
    type Message: Send;

    /// Process one message
    fn handle(&self, message: Self::Message);

    /// Flush all in-flight state before the handler is retired
    fn drain(&self);
}

impl Handler for Aggregator {
    type Message = Record;

    fn handle(&self, record: Record) {
        self.accept(&record);
    }

    fn drain(&self) {
        self.close_all();
    }
}

impl Handler for ClusterAggregator {
    type Message = StatisticSetRecord;

    fn handle(&self, record: StatisticSetRecord) {
        if let Err(e) = self.accept(&record) {
            error!(metric = %record.metric, host = %record.host, error = %e, "Failed to merge statistic set");
        }
    }

    fn drain(&self) {
        self.close_all();
    }
}

/// Lifecycle state of a [`HandoffProxy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    /// No handler; buffering
    Idle,
    /// Retiring the previous handler; buffering
    Draining,
    /// Building the new handler and replaying the buffer
    Starting,
    /// Delivering directly
    Running,
}

type Factory<C, H> = Box<dyn Fn(&C) -> Result<Arc<H>> + Send + Sync>;

struct Inner<H: Handler> {
    state: HandoffState,
    handler: Option<Arc<H>>,
    buffer: VecDeque<H::Message>,
}

/// Buffers messages while a handler built from configuration `C` is replaced
pub struct HandoffProxy<C, H: Handler> {
    name: String,
    capacity: usize,
    factory: Factory<C, H>,
    inner: Mutex<Inner<H>>,
    delivery: RwLock<()>,
    swap: Mutex<()>,
    dropped: AtomicU64,
}

impl<C, H: Handler> HandoffProxy<C, H> {
    /// Create an idle proxy that builds handlers with `factory`
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&C) -> Result<Arc<H>> + Send + Sync + 'static,
    {
        Self::with_capacity(name, DEFAULT_BUFFER_CAPACITY, factory)
    }

    /// Create an idle proxy with a custom buffer capacity
    pub fn with_capacity<F>(name: impl Into<String>, capacity: usize, factory: F) -> Self
    where
        F: Fn(&C) -> Result<Arc<H>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            factory: Box::new(factory),
            inner: Mutex::new(Inner {
                state: HandoffState::Idle,
                handler: None,
                buffer: VecDeque::new(),
            }),
            delivery: RwLock::new(()),
            swap: Mutex::new(()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Current state
    pub fn state(&self) -> HandoffState {
        self.inner.lock().state
    }

    /// Messages waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Messages dropped because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Handler currently receiving messages
    pub fn handler(&self) -> Option<Arc<H>> {
        self.inner.lock().handler.clone()
    }

    /// Deliver a message, or buffer it while no handler is running
    pub fn send(&self, message: H::Message) {
        let _delivery = self.delivery.read();
        let mut inner = self.inner.lock();
        if inner.state == HandoffState::Running {
            if let Some(handler) = inner.handler.clone() {
                drop(inner);
                handler.handle(message);
                return;
            }
        }
        if inner.buffer.len() >= self.capacity {
            inner.buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::HANDOFF_DROPS.with_label_values(&[&self.name]).inc();
            warn!(
                proxy = %self.name,
                capacity = self.capacity,
                state = ?inner.state,
                "Handoff buffer full, dropping oldest message"
            );
        }
        inner.buffer.push_back(message);
    }

    /// Stop direct delivery and take the running handler
    ///
    /// Waits for in-flight deliveries to finish; later messages are buffered.
    fn retire(&self) -> Option<Arc<H>> {
        let _delivery = self.delivery.write();
        let mut inner = self.inner.lock();
        inner.state = HandoffState::Draining;
        inner.handler.take()
    }

    /// Replace the running handler with one built from `config`
    ///
    /// The old handler is drained first. If building the new handler fails
    /// the proxy is left `Idle` and keeps buffering until the next
    /// successful call.
    pub fn apply_config(&self, config: &C) -> Result<()> {
        let _swap = self.swap.lock();

        let previous = self.retire();
        if let Some(old) = previous {
            info!(proxy = %self.name, "Draining previous handler");
            old.drain();
        }

        self.inner.lock().state = HandoffState::Starting;
        let handler = match (self.factory)(config) {
            Ok(handler) => handler,
            Err(e) => {
                self.inner.lock().state = HandoffState::Idle;
                error!(proxy = %self.name, error = %e, "Failed to start handler");
                return Err(e);
            },
        };

        let mut replayed = 0usize;
        loop {
            let batch: Vec<H::Message> = {
                let mut inner = self.inner.lock();
                if inner.buffer.is_empty() {
                    inner.handler = Some(Arc::clone(&handler));
                    inner.state = HandoffState::Running;
                    break;
                }
                inner.buffer.drain(..).collect()
            };
            replayed += batch.len();
            for message in batch {
                handler.handle(message);
            }
        }
        info!(proxy = %self.name, replayed, "Handler running");
        Ok(())
    }

    /// Drain and retire the running handler; later messages are buffered
    pub fn shutdown(&self) {
        let _swap = self.swap.lock();
        let previous = self.retire();
        if let Some(old) = previous {
            old.drain();
        }
        self.inner.lock().state = HandoffState::Idle;
        info!(proxy = %self.name, "Handler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct Recorder {
        tag: u32,
        seen: Mutex<Vec<(u32, u32)>>,
        drained: Mutex<bool>,
    }

    impl Handler for Recorder {
        type Message = u32;

        fn handle(&self, message: u32) {
            self.seen.lock().push((self.tag, message));
        }

        fn drain(&self) {
            *self.drained.lock() = true;
        }
    }

    fn proxy(capacity: usize) -> HandoffProxy<u32, Recorder> {
        HandoffProxy::with_capacity("test", capacity, |tag: &u32| {
            if *tag == 0 {
                return Err(Error::Configuration("tag 0".to_string()));
            }
            Ok(Arc::new(Recorder {
                tag: *tag,
                ..Default::default()
            }))
        })
    }

    #[test]
    fn test_buffers_until_started_then_replays_in_order() {
        let proxy = proxy(10);
        assert_eq!(proxy.state(), HandoffState::Idle);
        proxy.send(1);
        proxy.send(2);
        assert_eq!(proxy.buffered(), 2);

        proxy.apply_config(&7).unwrap();
        assert_eq!(proxy.state(), HandoffState::Running);
        proxy.send(3);

        let handler = proxy.handler().unwrap();
        assert_eq!(*handler.seen.lock(), vec![(7, 1), (7, 2), (7, 3)]);
        assert_eq!(proxy.buffered(), 0);
    }

    #[test]
    fn test_swap_drains_old_handler() {
        let proxy = proxy(10);
        proxy.apply_config(&1).unwrap();
        let old = proxy.handler().unwrap();
        proxy.apply_config(&2).unwrap();
        assert!(*old.drained.lock());
        proxy.send(5);
        assert!(old.seen.lock().is_empty());
        assert_eq!(*proxy.handler().unwrap().seen.lock(), vec![(2, 5)]);
    }

    #[test]
    fn test_full_buffer_drops_oldest() {
        let proxy = proxy(2);
        proxy.send(1);
        proxy.send(2);
        proxy.send(3);
        assert_eq!(proxy.dropped(), 1);
        proxy.apply_config(&1).unwrap();
        assert_eq!(*proxy.handler().unwrap().seen.lock(), vec![(1, 2), (1, 3)]);
    }

    #[test]
    fn test_failed_start_keeps_buffering() {
        let proxy = proxy(10);
        assert!(proxy.apply_config(&0).is_err());
        assert_eq!(proxy.state(), HandoffState::Idle);
        proxy.send(9);
        assert_eq!(proxy.buffered(), 1);
        proxy.apply_config(&4).unwrap();
        assert_eq!(*proxy.handler().unwrap().seen.lock(), vec![(4, 9)]);
    }

    struct SlowHandler {
        drained: Mutex<bool>,
        handled_before_drain: Mutex<Vec<bool>>,
        entered: std::sync::Barrier,
    }

    impl Handler for SlowHandler {
        type Message = u32;

        fn handle(&self, _message: u32) {
            self.entered.wait();
            std::thread::sleep(std::time::Duration::from_millis(50));
            let drained = *self.drained.lock();
            self.handled_before_drain.lock().push(!drained);
        }

        fn drain(&self) {
            *self.drained.lock() = true;
        }
    }

    #[test]
    fn test_drain_waits_for_in_flight_delivery() {
        let first = Arc::new(SlowHandler {
            drained: Mutex::new(false),
            handled_before_drain: Mutex::new(Vec::new()),
            entered: std::sync::Barrier::new(2),
        });
        let factory_first = Arc::clone(&first);
        let proxy: HandoffProxy<bool, SlowHandler> =
            HandoffProxy::new("slow", move |initial: &bool| {
                if *initial {
                    Ok(Arc::clone(&factory_first))
                } else {
                    Ok(Arc::new(SlowHandler {
                        drained: Mutex::new(false),
                        handled_before_drain: Mutex::new(Vec::new()),
                        entered: std::sync::Barrier::new(1),
                    }))
                }
            });
        proxy.apply_config(&true).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| proxy.send(1));
            // Wait until the message is inside `handle`, then swap
            first.entered.wait();
            proxy.apply_config(&false).unwrap();
        });

        assert!(*first.drained.lock());
        assert_eq!(*first.handled_before_drain.lock(), vec![true]);
    }

    #[test]
    fn test_shutdown() {
        let proxy = proxy(10);
        proxy.apply_config(&1).unwrap();
        let handler = proxy.handler().unwrap();
        proxy.shutdown();
        assert!(*handler.drained.lock());
        assert_eq!(proxy.state(), HandoffState::Idle);
        proxy.send(1);
        assert_eq!(proxy.buffered(), 1);
    }
}
