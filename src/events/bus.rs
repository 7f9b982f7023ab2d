//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the synchronous event bus every book publishes
// through. Handlers are registered per event type (or for all types) and run
// on the publisher's thread, inside the book's lock, before publish returns.
// Handlers must therefore be fast and must not call back into the book API;
// long-running consumers hand off to their own queue or use AsyncDispatcher.
//
// | Name           | Description                                   | Key Methods                  |
// |----------------|-----------------------------------------------|------------------------------|
// | EventHandler   | Trait for synchronous event consumers         | on_event                     |
// | EventBus       | Typed publish/subscribe with history ring     | publish, subscribe, history  |
// | SubscriptionId | Token returned by subscribe, for unsubscribe  | -                            |
//--------------------------------------------------------------------------------------------------

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use super::types::{BookEvent, EventResult, EventType};

/// Default capacity of the bounded event history ring.
pub const DEFAULT_EVENT_HISTORY: usize = 1000;

/// A synchronous event consumer. Handler errors are logged and isolated: a
/// failing handler never prevents its siblings from running.
pub trait EventHandler: Send + Sync {
    /// Processes one event.
    fn on_event(&self, event: &BookEvent) -> EventResult<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&BookEvent) -> EventResult<()> + Send + Sync,
{
    fn on_event(&self, event: &BookEvent) -> EventResult<()> {
        self(event)
    }
}

/// Token identifying one subscription, consumed by [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type HandlerEntry = (SubscriptionId, Arc<dyn EventHandler>);

/// Central event bus: per-type handler lists, a subscribe-all list, and a
/// bounded ring of recent events for retrieval.
pub struct EventBus {
    next_id: AtomicU64,
    typed: RwLock<HashMap<EventType, Vec<HandlerEntry>>>,
    all: RwLock<Vec<HandlerEntry>>,
    history: Mutex<VecDeque<BookEvent>>,
    max_history: usize,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("max_history", &self.max_history)
            .field("typed_subscriptions", &self.typed.read().values().map(Vec::len).sum::<usize>())
            .field("all_subscriptions", &self.all.read().len())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_HISTORY)
    }
}

impl EventBus {
    /// Creates a bus retaining at most `max_history` recent events.
    pub fn new(max_history: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            typed: RwLock::new(HashMap::new()),
            all: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(max_history.min(1024))),
            max_history,
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a handler for one event type.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.allocate_id();
        self.typed.write().entry(event_type).or_default().push((id, handler));
        debug!(?event_type, subscription = id.0, "handler subscribed");
        id
    }

    /// Registers a closure for one event type.
    pub fn subscribe_fn<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&BookEvent) -> EventResult<()> + Send + Sync + 'static,
    {
        self.subscribe(event_type, Arc::new(handler))
    }

    /// Registers a handler for every event type.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.allocate_id();
        self.all.write().push((id, handler));
        debug!(subscription = id.0, "handler subscribed to all events");
        id
    }

    /// Registers a closure for every event type.
    pub fn subscribe_all_fn<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BookEvent) -> EventResult<()> + Send + Sync + 'static,
    {
        self.subscribe_all(Arc::new(handler))
    }

    /// Removes a subscription. Returns true when it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        {
            let mut typed = self.typed.write();
            for handlers in typed.values_mut() {
                if let Some(position) = handlers.iter().position(|(hid, _)| *hid == id) {
                    handlers.remove(position);
                    return true;
                }
            }
        }
        let mut all = self.all.write();
        if let Some(position) = all.iter().position(|(hid, _)| *hid == id) {
            all.remove(position);
            return true;
        }
        false
    }

    /// Publishes an event to every matching handler, synchronously: all
    /// handlers have run when this returns. Handler errors are logged and do
    /// not stop sibling handlers.
    pub fn publish(&self, event: BookEvent) {
        {
            let mut history = self.history.lock();
            if self.max_history > 0 {
                if history.len() == self.max_history {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        let typed_handlers: Vec<Arc<dyn EventHandler>> = self
            .typed
            .read()
            .get(&event.event_type())
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        let all_handlers: Vec<Arc<dyn EventHandler>> =
            self.all.read().iter().map(|(_, h)| Arc::clone(h)).collect();

        for handler in typed_handlers.iter().chain(all_handlers.iter()) {
            if let Err(err) = handler.on_event(&event) {
                error!(event_type = ?event.event_type(), %err, "event handler failed");
            }
        }
    }

    /// Returns up to `limit` recent events, newest first, optionally filtered
    /// by event type and symbol.
    pub fn history(
        &self,
        limit: usize,
        event_type: Option<EventType>,
        symbol: Option<&str>,
    ) -> Vec<BookEvent> {
        self.history
            .lock()
            .iter()
            .rev()
            .filter(|event| event_type.map_or(true, |t| event.event_type() == t))
            .filter(|event| symbol.map_or(true, |s| event.symbol == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of registered handlers across all subscriptions.
    pub fn handler_count(&self) -> usize {
        self.typed.read().values().map(Vec::len).sum::<usize>() + self.all.read().len()
    }
}
