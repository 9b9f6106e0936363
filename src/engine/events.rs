// src/engine/events.rs

//! Broadcast bus for human-readable engine events.
//!
//! Producers push strings into a bounded channel; a single fan-out task
//! copies each event into every subscriber's own bounded buffer. A subscriber
//! whose buffer is full misses that event rather than stalling the bus.
//! Closing the bus stops new emits; events already queued are still
//! delivered before the subscriber streams end.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dag::DagError;

/// Receiving end handed to a subscriber.
pub type EventStream = mpsc::Receiver<String>;

/// Default capacity of the bus channel.
pub const DEFAULT_EVENT_BUFFER: usize = 15;
/// Default capacity of each subscriber's buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 200;

/// `emit_event!(bus, "start task {}", name)` awaits `bus.emit(format!(..))`.
macro_rules! emit_event {
    ($bus:expr, $($arg:tt)+) => {
        $bus.emit(format!($($arg)+)).await
    };
}
pub(crate) use emit_event;

struct Subscriber {
    buffer: Mutex<Option<mpsc::Sender<String>>>,
}

impl Subscriber {
    fn deliver(&self, event: &str) -> bool {
        let guard = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.try_send(event.to_string()).is_ok(),
            None => false,
        }
    }

    /// Drop the sender so the subscriber's stream ends after draining.
    fn close(&self) {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

struct Subscribers {
    entries: DashMap<i64, Arc<Subscriber>>,
    closed: Mutex<bool>,
    next_id: AtomicI64,
    capacity: usize,
    shutdown: CancellationToken,
}

impl Subscribers {
    fn broadcast(&self, event: &str) {
        // Snapshot first so no shard lock is held while delivering.
        let targets: Vec<(i64, Arc<Subscriber>)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        for (id, sub) in targets {
            if !sub.deliver(event) {
                trace!(subscriber = id, "subscriber buffer full, event dropped");
            }
        }
    }

    fn close_all(&self) {
        for entry in self.entries.iter() {
            entry.value().close();
        }
        self.entries.clear();
    }
}

/// Cheaply cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<String>,
    subscribers: Arc<Subscribers>,
}

impl EventBus {
    /// Create the bus and spawn its fan-out task. Requires a Tokio runtime.
    pub fn new(capacity: usize, subscriber_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let subscribers = Arc::new(Subscribers {
            entries: DashMap::new(),
            closed: Mutex::new(false),
            next_id: AtomicI64::new(1),
            capacity: subscriber_capacity.max(1),
            shutdown: CancellationToken::new(),
        });

        let fanout = Arc::clone(&subscribers);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => fanout.broadcast(&event),
                        None => break,
                    },
                    _ = fanout.shutdown.cancelled() => {
                        while let Ok(event) = rx.try_recv() {
                            fanout.broadcast(&event);
                        }
                        break;
                    }
                }
            }
            fanout.close_all();
            debug!("event bus drained");
        });

        Self { tx, subscribers }
    }

    /// Publish an event, waiting for room in the bus channel.
    pub async fn emit(&self, event: String) {
        if self.is_closed() {
            return;
        }
        if self.tx.send(event).await.is_err() {
            debug!("event bus receiver gone, event discarded");
        }
    }

    /// Publish from synchronous code. Drops the event when the bus channel is
    /// full.
    pub fn try_emit(&self, event: String) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.tx.try_send(event) {
            warn!(error = %err, "event bus full, event dropped");
        }
    }

    /// Register a new subscriber. Fails once the bus has been closed.
    pub fn subscribe(&self) -> Result<(EventStream, i64), DagError> {
        let closed = self.subscribers.closed.lock().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return Err(DagError::EventBusClosed);
        }

        let (tx, rx) = mpsc::channel(self.subscribers.capacity);
        let id = self.subscribers.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.entries.insert(
            id,
            Arc::new(Subscriber {
                buffer: Mutex::new(Some(tx)),
            }),
        );
        debug!(subscriber = id, "subscribed to event bus");
        Ok((rx, id))
    }

    /// Remove a subscriber and end its stream. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: i64) {
        if let Some((_, sub)) = self.subscribers.entries.remove(&id) {
            sub.close();
            debug!(subscriber = id, "unsubscribed from event bus");
        }
    }

    /// Close the bus. Later emits are ignored and later subscriptions fail
    /// with [`DagError::EventBusClosed`]; subscriber streams end once the
    /// fan-out task has delivered everything already queued.
    pub fn close(&self) {
        let mut closed = self.subscribers.closed.lock().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return;
        }
        *closed = true;
        self.subscribers.shutdown.cancel();
        debug!("event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.subscribers.closed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn next(rx: &mut EventStream) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_event() {
        let bus = EventBus::new(DEFAULT_EVENT_BUFFER, DEFAULT_SUBSCRIBER_BUFFER);
        let (mut a, _) = bus.subscribe().unwrap();
        let (mut b, _) = bus.subscribe().unwrap();

        emit_event!(bus, "start task {}", "t");
        assert_eq!(next(&mut a).await.as_deref(), Some("start task t"));
        assert_eq!(next(&mut b).await.as_deref(), Some("start task t"));
    }

    #[tokio::test]
    async fn unsubscribe_ends_stream() {
        let bus = EventBus::new(4, 4);
        let (mut rx, id) = bus.subscribe().unwrap();
        bus.unsubscribe(id);
        assert_eq!(next(&mut rx).await, None);
        assert_eq!(bus.subscriber_count(), 0);
        // Unknown id is a no-op.
        bus.unsubscribe(id);
    }

    #[tokio::test]
    async fn subscribe_after_close_fails() {
        let bus = EventBus::new(4, 4);
        let (mut rx, _) = bus.subscribe().unwrap();
        bus.close();
        assert!(matches!(bus.subscribe(), Err(DagError::EventBusClosed)));
        assert_eq!(next(&mut rx).await, None);
        // Emitting into a closed bus is silently ignored.
        bus.emit("late".to_string()).await;
        bus.try_emit("late".to_string());
    }

    #[tokio::test]
    async fn close_delivers_queued_events_first() {
        let bus = EventBus::new(DEFAULT_EVENT_BUFFER, DEFAULT_SUBSCRIBER_BUFFER);
        let (mut rx, _) = bus.subscribe().unwrap();
        for i in 0..10 {
            bus.emit(format!("event {i}")).await;
        }
        bus.close();

        let mut received = Vec::new();
        while let Some(event) = next(&mut rx).await {
            received.push(event);
        }
        let expected: Vec<String> = (0..10).map(|i| format!("event {i}")).collect();
        assert_eq!(received, expected);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new(4, 2);
        let (mut slow, _) = bus.subscribe().unwrap();
        let (mut fast, _) = bus.subscribe().unwrap();

        let mut received = 0;
        for i in 0..10 {
            bus.emit(format!("event {i}")).await;
            if next(&mut fast).await.is_some() {
                received += 1;
            }
        }
        assert_eq!(received, 10);

        let mut buffered = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(50), slow.recv()).await
        {
            buffered += 1;
        }
        assert_eq!(buffered, 2);
    }
}
