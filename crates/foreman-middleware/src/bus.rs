//! Lifecycle event bus.
//!
//! Two delivery styles share one [`EventBus`] handle:
//!
//! * **Listeners** (`subscribe_fn`) – synchronous callbacks invoked on the
//!   publishing thread, in registration order. A listener that returns an
//!   error or panics is logged and skipped; the remaining listeners still
//!   run and the publisher never observes the failure.
//! * **Channels** (`subscribe` / `subscribe_to`) – [`tokio::sync::broadcast`]
//!   receivers for async consumers such as the REPL's event printer.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Transitions`] | `StateTransition` events from every state machine |
//! | [`Topic::Actions`] | `ActionStarted` / `ActionCompleted` from executors |
//!
//! Publishing never fails. With no channel receivers the event is still
//! delivered to listeners and the call returns the number of consumers that
//! saw it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use foreman_types::{Event, LifecycleEvent};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes for channel subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Lifecycle state changes.
    Transitions,
    /// Action start and completion records.
    Actions,
}

impl Topic {
    /// The lane an event is routed to.
    pub fn of(event: &Event) -> Topic {
        match event.payload {
            LifecycleEvent::StateTransition { .. } => Topic::Transitions,
            LifecycleEvent::ActionStarted { .. } | LifecycleEvent::ActionCompleted { .. } => {
                Topic::Actions
            }
        }
    }
}

/// Handle returned by [`EventBus::subscribe_fn`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;
type ListenerList = Arc<Vec<(ListenerId, Listener)>>;

/// Shared event bus. Clone it cheaply – all clones share the same channels
/// and listener list.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    transitions: broadcast::Sender<Event>,
    actions: broadcast::Sender<Event>,
    // Copy-on-write: publishers clone the Arc and iterate without holding
    // the lock, so listeners may subscribe or unsubscribe from a callback.
    listeners: Arc<RwLock<ListenerList>>,
    next_listener: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let (transitions, _) = broadcast::channel(capacity);
        let (actions, _) = broadcast::channel(capacity);
        Self {
            sender,
            transitions,
            actions,
            listeners: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Deliver `event` to every listener, then to the global channel and the
    /// event's topic channel.
    ///
    /// Returns how many consumers (listeners plus channel receivers) were
    /// handed the event. Zero is a normal outcome.
    pub fn publish(&self, event: Event) -> usize {
        let listeners = self.snapshot();
        let mut delivered = 0;

        for (id, listener) in listeners.iter() {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(reason)) => {
                    warn!(listener = id.0, event_id = %event.id, %reason, "event listener failed");
                }
                Err(_) => {
                    warn!(listener = id.0, event_id = %event.id, "event listener panicked");
                }
            }
        }

        let topic = Topic::of(&event);
        // `send` only errors when nobody is listening.
        delivered += self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        delivered += self.sender.send(event).unwrap_or(0);
        delivered
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Register a synchronous listener. It runs on the publisher's thread.
    pub fn subscribe_fn<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Event) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let mut next: Vec<(ListenerId, Listener)> = guard.as_ref().clone();
        next.push((id, Arc::new(listener)));
        *guard = Arc::new(next);
        id
    }

    /// Remove a listener. Returns `false` when `id` was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = guard.len();
        let next: Vec<(ListenerId, Listener)> = guard
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.snapshot().len()
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Subscribe to every event on the global channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Subscribe to a single [`Topic`] lane.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn snapshot(&self) -> ListenerList {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Transitions => &self.transitions,
            Topic::Actions => &self.actions,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns `None` once the bus is gone. Lagging is logged and skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "topic receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll used by tick-driven consumers.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "topic receiver lagged");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
