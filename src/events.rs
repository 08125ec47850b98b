//! Event channel for metric and alert notifications.
//!
//! Listeners registered with [`EventBus::on`] or [`EventBus::once`] run
//! synchronously inside the call that produced the event, in registration
//! order. Async consumers can [`EventBus::subscribe`] to a broadcast queue
//! instead; a lagging subscriber loses old events rather than blocking the
//! tracker.

use std::fmt::{self, Debug, Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::alerts::Alert;
use crate::measurement::{ErrorInfo, Measurement};

// ----------------------------------------------------------------------------
// Event Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A Measurement was recorded
    Metric,
    /// A threshold was violated
    Alert,
    AlertAcknowledged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Metric => "metric",
            EventKind::Alert => "alert",
            EventKind::AlertAcknowledged => "alertAcknowledged",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to listeners and subscribers.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Metric(Arc<Measurement>),
    Alert(Arc<Alert>),
    AlertAcknowledged(Arc<Alert>),
}

impl TrackerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TrackerEvent::Metric(_) => EventKind::Metric,
            TrackerEvent::Alert(_) => EventKind::Alert,
            TrackerEvent::AlertAcknowledged(_) => EventKind::AlertAcknowledged,
        }
    }
}

/// Handle returned on registration, used to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl Display for ListenerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

pub type Listener = Arc<dyn Fn(&TrackerEvent) + Send + Sync>;

struct Registration {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    callback: Listener,
}

// ----------------------------------------------------------------------------
// Event Bus
// ----------------------------------------------------------------------------

pub struct EventBus {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    /// `None` once the bus has been closed
    sender: RwLock<Option<broadcast::Sender<TrackerEvent>>>,
    emitted: AtomicU64,
    listener_panics: AtomicU64,
}

impl EventBus {
    pub fn new(broadcast_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender: RwLock::new(Some(sender)),
            emitted: AtomicU64::new(0),
            listener_panics: AtomicU64::new(0),
        }
    }

    fn register<F>(&self, kind: EventKind, once: bool, callback: F) -> ListenerId
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        self.listeners.write().push(Registration {
            id,
            kind,
            once,
            callback: Arc::new(callback),
        });
        debug!(target: "perftrack::events", %id, event = %kind, once, "Listener registered");
        id
    }

    /// Invoke `callback` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        self.register(kind, false, callback)
    }

    /// Invoke `callback` for the next event of `kind` only.
    pub fn once<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&TrackerEvent) + Send + Sync + 'static,
    {
        self.register(kind, true, callback)
    }

    /// Detach a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        before != listeners.len()
    }

    /// Receiver for async consumers. Closed once the bus is cleared.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        match self.sender.read().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (closed, receiver) = broadcast::channel(1);
                drop(closed);
                receiver
            }
        }
    }

    /// Listeners for `kind` in registration order. One-shot listeners are
    /// detached here, before anything runs, so each fires at most once.
    fn take_listeners(&self, kind: EventKind) -> Vec<Listener> {
        {
            let listeners = self.listeners.read();
            if !listeners.iter().any(|r| r.kind == kind && r.once) {
                return listeners
                    .iter()
                    .filter(|r| r.kind == kind)
                    .map(|r| r.callback.clone())
                    .collect();
            }
        }

        let mut listeners = self.listeners.write();
        let mut matched = Vec::new();
        listeners.retain(|r| {
            if r.kind != kind {
                return true;
            }
            matched.push(r.callback.clone());
            !r.once
        });
        matched
    }

    /// Deliver `event` to listeners, then to async subscribers.
    ///
    /// No lock is held while listeners run, so a listener may register or
    /// detach listeners. A panicking listener is logged and skipped.
    pub fn emit(&self, event: TrackerEvent) {
        let kind = event.kind();
        for callback in self.take_listeners(kind) {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                self.listener_panics.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(
                    target: "perftrack::events",
                    event = %kind,
                    panic = %ErrorInfo::from_panic(&*payload).message,
                    "Event listener panicked"
                );
            }
        }

        if let Some(sender) = self.sender.read().as_ref() {
            // No receivers is not an error.
            let _ = sender.send(event);
        }
        self.emitted.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(AtomicOrdering::Relaxed)
    }

    pub fn listener_panics(&self) -> u64 {
        self.listener_panics.load(AtomicOrdering::Relaxed)
    }

    /// Detach every listener.
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
    }

    /// Detach every listener and close the broadcast queue.
    pub fn close(&self) {
        self.clear_listeners();
        self.sender.write().take();
    }
}

impl Debug for EventBus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.subscriber_count())
            .field("emitted", &self.emitted())
            .finish()
    }
}
