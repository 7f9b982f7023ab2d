//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the opt-in asynchronous dispatch mode. The
// synchronous bus runs handlers inside the book's lock; consumers that cannot
// afford that attach an AsyncDispatcher, which forwards every event into a
// broadcast channel and drives registered async handlers from a background
// task. The only ordering guarantee in this mode is FIFO per bus.
//
// | Name              | Description                                       | Key Methods       |
// |-------------------|---------------------------------------------------|-------------------|
// | AsyncEventHandler | Trait for asynchronous event consumers            | handle_event      |
// | AsyncDispatcher   | Broadcast feed + background handler driver        | attach, start     |
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use super::bus::{EventBus, SubscriptionId};
use super::types::{BookEvent, EventResult, EventType};

/// An asynchronous event consumer driven by [`AsyncDispatcher`].
#[async_trait::async_trait]
pub trait AsyncEventHandler: Send + Sync {
    /// The event types this handler wants to receive.
    fn event_types(&self) -> Vec<EventType>;

    /// Processes one event.
    async fn handle_event(&self, event: BookEvent) -> EventResult<()>;
}

/// Fans events out of the synchronous bus into async consumers.
pub struct AsyncDispatcher {
    sender: broadcast::Sender<BookEvent>,
    handlers: Arc<RwLock<HashMap<EventType, Vec<Arc<dyn AsyncEventHandler>>>>>,
    capacity: usize,
}

impl fmt::Debug for AsyncDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncDispatcher")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl AsyncDispatcher {
    /// Creates a dispatcher whose feed buffers up to `capacity` events before
    /// slow subscribers start lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Bridges a synchronous bus into this dispatcher: every event published
    /// on `bus` is forwarded into the broadcast feed. The forwarding handler
    /// only clones and sends, so it is safe inside the book lock.
    pub fn attach(&self, bus: &EventBus) -> SubscriptionId {
        let sender = self.sender.clone();
        bus.subscribe_all_fn(move |event| {
            // A send error just means no receiver is currently listening.
            let _ = sender.send(event.clone());
            Ok(())
        })
    }

    /// Registers an async handler for the event types it declares.
    pub async fn register_handler(&self, handler: Arc<dyn AsyncEventHandler>) {
        let mut handlers = self.handlers.write().await;
        for event_type in handler.event_types() {
            handlers.entry(event_type).or_default().push(Arc::clone(&handler));
        }
        debug!("registered async handler for {:?}", handler.event_types());
    }

    /// Opens a raw subscription to the broadcast feed for consumers that
    /// prefer driving their own receive loop.
    pub fn subscribe(&self) -> broadcast::Receiver<BookEvent> {
        self.sender.subscribe()
    }

    /// Starts the background task that drains the feed and drives registered
    /// handlers. Handlers run sequentially per event, preserving FIFO order.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let handlers = Arc::clone(&self.handlers);
        let mut receiver = self.sender.subscribe();

        tokio::spawn(async move {
            info!("async event dispatcher started");
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        error!(missed, "async dispatcher lagged; events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let handlers_lock = handlers.read().await;
                if let Some(event_handlers) = handlers_lock.get(&event.event_type()) {
                    for handler in event_handlers {
                        if let Err(err) = handler.handle_event(event.clone()).await {
                            error!(event_type = ?event.event_type(), %err, "async handler failed");
                        }
                    }
                }
            }
            info!("async event dispatcher stopped");
        })
    }
}

impl Default for AsyncDispatcher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::EventKind;
    use crate::types::Side;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        types: Vec<EventType>,
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AsyncEventHandler for CountingHandler {
        fn event_types(&self) -> Vec<EventType> {
            self.types.clone()
        }

        async fn handle_event(&self, _event: BookEvent) -> EventResult<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_type() {
        let bus = EventBus::default();
        let dispatcher = AsyncDispatcher::new(64);
        dispatcher.attach(&bus);

        let handler = Arc::new(CountingHandler {
            types: vec![EventType::PriceLevelAdded],
            seen: AtomicUsize::new(0),
        });
        dispatcher.register_handler(handler.clone()).await;
        let _task = dispatcher.start();

        bus.publish(BookEvent::new(
            "BTC/USD",
            EventKind::PriceLevelAdded { side: Side::Buy, price: dec!(100) },
        ));
        bus.publish(BookEvent::new(
            "BTC/USD",
            EventKind::BookUpdated { best_bid: Some(dec!(100)), best_ask: None },
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_raw_subscription_preserves_fifo() {
        let bus = EventBus::default();
        let dispatcher = AsyncDispatcher::new(64);
        dispatcher.attach(&bus);
        let mut receiver = dispatcher.subscribe();

        for price in [dec!(1), dec!(2), dec!(3)] {
            bus.publish(BookEvent::new(
                "BTC/USD",
                EventKind::PriceLevelAdded { side: Side::Sell, price },
            ));
        }

        for expected in [dec!(1), dec!(2), dec!(3)] {
            let event = receiver.recv().await.unwrap();
            match event.kind {
                EventKind::PriceLevelAdded { price, .. } => assert_eq!(price, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
