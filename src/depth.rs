//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module defines the aggregated depth views of an order book: per-level
// aggregates and the immutable point-in-time snapshot handed to consumers.
//
// | Component     | Description                                                 |
// |---------------|-------------------------------------------------------------|
// | DepthLevel    | Aggregated quantity and order count at one price            |
// | BookSnapshot  | Immutable snapshot of both sides, wire-stable JSON          |
//--------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An aggregated price level inside a depth view.
///
/// Serializes prices and quantities as JSON numbers so the wire format stays
/// `{"price": 20000.0, "quantity": 1.5, "order_count": 3}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// The price for this level.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Aggregated quantity at this price.
    #[serde(with = "rust_decimal::serde::float")]
    pub quantity: Decimal,
    /// Number of orders contributing to the aggregate.
    pub order_count: usize,
}

/// An immutable, point-in-time view of the book taken under the book's lock.
///
/// Bids are ordered best (highest) first, asks best (lowest) first, truncated
/// to the requested depth. Two snapshots taken with no intervening mutation
/// carry identical `bids`/`asks` arrays; only `timestamp` differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Symbol of the book this snapshot describes.
    pub symbol: String,
    /// Capture time as fractional epoch seconds.
    pub timestamp: f64,
    /// Bid levels, best first.
    pub bids: Vec<DepthLevel>,
    /// Ask levels, best first.
    pub asks: Vec<DepthLevel>,
}

impl BookSnapshot {
    /// Creates a snapshot stamped with the current time.
    pub fn new(symbol: impl Into<String>, bids: Vec<DepthLevel>, asks: Vec<DepthLevel>) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp: Self::stamp(Utc::now()),
            bids,
            asks,
        }
    }

    fn stamp(at: DateTime<Utc>) -> f64 {
        at.timestamp_micros() as f64 / 1_000_000.0
    }

    /// The best (highest) bid price, if any bids rest.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|level| level.price)
    }

    /// The best (lowest) ask price, if any asks rest.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|level| level.price)
    }

    /// Difference between best ask and best bid.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Midpoint between best bid and best ask.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => Some((ask + bid) / Decimal::TWO),
            _ => None,
        }
    }

    /// Compares the depth arrays of two snapshots, ignoring timestamps.
    pub fn same_depth(&self, other: &Self) -> bool {
        self.bids == other.bids && self.asks == other.asks
    }
}
