//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name        | Description                                        | Key Methods      |
// |-------------|----------------------------------------------------|------------------|
// | EventType   | Discriminant used for typed subscriptions          | -                |
// | BookEvent   | A published event: symbol + timestamp + payload    | new, event_type  |
// | EventKind   | Payload variants for every lifecycle event         | event_type       |
// | EventError  | Error types for event processing                   | -                |
//--------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::depth::DepthLevel;
use crate::types::{CancelReason, Order, Side, Trade};

/// Errors that can occur in the event system.
#[derive(Error, Debug, Clone)]
pub enum EventError {
    /// A handler failed to process an event. Logged by the bus, never
    /// propagated to sibling handlers.
    #[error("event handler failed: {0}")]
    Handler(String),

    /// Failed to hand an event to the asynchronous dispatch feed.
    #[error("failed to publish event: {0}")]
    Publish(String),
}

/// Type alias for Result with EventError.
pub type EventResult<T> = Result<T, EventError>;

/// Discriminant for every event the engine publishes. Subscriptions are keyed
/// on this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    OrderAdded,
    OrderModified,
    OrderCancelled,
    OrderFilled,
    OrderExpired,
    OrderRejected,
    TradeExecuted,
    PriceLevelAdded,
    PriceLevelRemoved,
    PriceLevelChanged,
    BookUpdated,
    DepthChanged,
    SnapshotCreated,
    GeneratorStatus,
}

/// A published event: the owning book's symbol, the emission time, and the
/// typed payload.
#[derive(Debug, Clone, Serialize)]
pub struct BookEvent {
    /// Symbol of the book that emitted the event.
    pub symbol: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// The typed payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl BookEvent {
    /// Stamps a payload with the emitting book's symbol and the current time.
    pub fn new(symbol: impl Into<String>, kind: EventKind) -> Self {
        Self { symbol: symbol.into(), timestamp: Utc::now(), kind }
    }

    /// The discriminant of this event's payload.
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}

/// Payloads for every event the engine publishes.
///
/// Events for a single order id arrive in causal order: added, then any
/// modifications, then fills, then at most one terminal cancel/expiry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// An order was accepted and rested on the book (or parked as a stop).
    OrderAdded {
        /// The accepted order.
        order: Order,
    },

    /// An order was modified in place or re-queued.
    OrderModified {
        /// The order after the modification.
        order: Order,
        /// Whether the change cost the order its time priority.
        lost_priority: bool,
    },

    /// An order left the book without being fully filled.
    OrderCancelled {
        /// Id of the cancelled order.
        order_id: String,
        /// User behind the order, when known.
        user_id: Option<String>,
        /// Why the order was cancelled.
        reason: CancelReason,
        /// Quantity still unfilled at cancellation.
        remaining_quantity: Decimal,
    },

    /// An order traded. Emitted for maker and taker on every fill.
    OrderFilled {
        /// Id of the filled order.
        order_id: String,
        /// User behind the order, when known.
        user_id: Option<String>,
        /// Quantity exchanged in this fill.
        fill_quantity: Decimal,
        /// Quantity still open after this fill.
        remaining_quantity: Decimal,
        /// Set when a market order exhausted the opposing side and its
        /// remainder was discarded.
        insufficient_liquidity: bool,
    },

    /// An order reached its expiry deadline and was removed by the sweeper.
    OrderExpired {
        /// Id of the expired order.
        order_id: String,
        /// User behind the order, when known.
        user_id: Option<String>,
        /// Quantity still unfilled at expiry.
        remaining_quantity: Decimal,
    },

    /// An order was rejected with no book state change.
    OrderRejected {
        /// Id of the rejected order.
        order_id: String,
        /// Human-readable rejection reason.
        reason: String,
    },

    /// A maker/taker fill completed, with the full fee breakdown.
    TradeExecuted {
        /// The executed trade.
        trade: Trade,
    },

    /// A new price level appeared on one side.
    PriceLevelAdded {
        /// Side the level rests on.
        side: Side,
        /// Price of the new level.
        price: Decimal,
    },

    /// A price level emptied and was removed.
    PriceLevelRemoved {
        /// Side the level rested on.
        side: Side,
        /// Price of the removed level.
        price: Decimal,
    },

    /// A price level's aggregate changed.
    PriceLevelChanged {
        /// Side the level rests on.
        side: Side,
        /// Price of the level.
        price: Decimal,
        /// New aggregate quantity (displayed view).
        quantity: Decimal,
        /// New number of orders at the level.
        order_count: usize,
    },

    /// A mutating operation completed; best prices may have moved.
    BookUpdated {
        /// Best bid after the operation.
        best_bid: Option<Decimal>,
        /// Best ask after the operation.
        best_ask: Option<Decimal>,
    },

    /// The top levels visible to depth consumers changed.
    DepthChanged {
        /// Top bid levels after the change.
        bids: Vec<DepthLevel>,
        /// Top ask levels after the change.
        asks: Vec<DepthLevel>,
    },

    /// A snapshot was taken.
    SnapshotCreated {
        /// The depth limit requested, when one was.
        depth: Option<usize>,
    },

    /// Status report from an order generator feeding this book.
    GeneratorStatus {
        /// Whether the generator is running.
        running: bool,
        /// Free-form status detail.
        detail: String,
    },
}

impl EventKind {
    /// The discriminant used for typed subscriptions.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::OrderAdded { .. } => EventType::OrderAdded,
            Self::OrderModified { .. } => EventType::OrderModified,
            Self::OrderCancelled { .. } => EventType::OrderCancelled,
            Self::OrderFilled { .. } => EventType::OrderFilled,
            Self::OrderExpired { .. } => EventType::OrderExpired,
            Self::OrderRejected { .. } => EventType::OrderRejected,
            Self::TradeExecuted { .. } => EventType::TradeExecuted,
            Self::PriceLevelAdded { .. } => EventType::PriceLevelAdded,
            Self::PriceLevelRemoved { .. } => EventType::PriceLevelRemoved,
            Self::PriceLevelChanged { .. } => EventType::PriceLevelChanged,
            Self::BookUpdated { .. } => EventType::BookUpdated,
            Self::DepthChanged { .. } => EventType::DepthChanged,
            Self::SnapshotCreated { .. } => EventType::SnapshotCreated,
            Self::GeneratorStatus { .. } => EventType::GeneratorStatus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_type_mapping() {
        let kind = EventKind::PriceLevelAdded { side: Side::Buy, price: dec!(100) };
        assert_eq!(kind.event_type(), EventType::PriceLevelAdded);

        let kind = EventKind::OrderRejected {
            order_id: "x".to_string(),
            reason: "fill-or-kill order unfillable".to_string(),
        };
        assert_eq!(kind.event_type(), EventType::OrderRejected);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = BookEvent::new(
            "BTC/USD",
            EventKind::OrderCancelled {
                order_id: "a1".to_string(),
                user_id: None,
                reason: CancelReason::IocRemainder,
                remaining_quantity: dec!(1.0),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "ORDER_CANCELLED");
        assert_eq!(json["symbol"], "BTC/USD");
        assert_eq!(json["reason"], "IOC_REMAINDER");
    }
}
