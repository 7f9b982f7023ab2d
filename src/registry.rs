//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the multi-instrument registry: one OrderBook per
// symbol, a global order-id -> symbol route for cancel/modify without a
// symbol, and a per-user order index. Both indexes are maintained
// incrementally by a registry-owned handler subscribed to every child book's
// lifecycle events. The registry never holds two book locks at once, so
// different symbols always run independently.
//
// | Name               | Description                                       | Key Methods          |
// |--------------------|---------------------------------------------------|----------------------|
// | MarketRegistry     | symbol -> OrderBook composition                   | create, place, cancel|
// | RegistryStatistics | Aggregated per-market statistics                  | -                    |
// | RegistryError      | Errors for registry-level routing                 | -                    |
//--------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BookConfig;
use crate::depth::BookSnapshot;
use crate::events::{BookEvent, EventKind, EventResult, EventType};
use crate::orderbook::{ModifyReport, OrderBook, SubmitReport};
use crate::stats::BookStatistics;
use crate::types::{Order, OrderBookError, OrderPatch, OrderSpec};

/// Errors raised by registry-level routing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// A market with this symbol already exists.
    #[error("market already exists: {0}")]
    MarketExists(String),

    /// No market with this symbol exists.
    #[error("market not found: {0}")]
    MarketNotFound(String),

    /// No market knows this order id.
    #[error("order not found in any market: {0}")]
    OrderNotFound(String),

    /// The owning book rejected the operation.
    #[error(transparent)]
    Book(#[from] OrderBookError),
}

/// Type alias for Result with RegistryError.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Aggregated statistics across every market.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    /// Number of markets.
    pub total_markets: usize,
    /// Resting orders across all markets.
    pub total_open_orders: usize,
    /// Users with at least one live order.
    pub total_users: usize,
    /// Per-market statistics keyed by symbol.
    pub markets: BTreeMap<String, BookStatistics>,
}

/// Shared lookup state kept in sync by event subscription.
#[derive(Debug, Default)]
struct RegistryIndex {
    /// order_id -> owning symbol.
    order_to_symbol: RwLock<HashMap<String, String>>,
    /// user_id -> live order ids.
    user_orders: RwLock<HashMap<String, HashSet<String>>>,
}

impl RegistryIndex {
    fn track(&self, symbol: &str, order_id: &str, user_id: Option<&str>) {
        self.order_to_symbol.write().insert(order_id.to_string(), symbol.to_string());
        if let Some(user_id) = user_id {
            self.user_orders
                .write()
                .entry(user_id.to_string())
                .or_default()
                .insert(order_id.to_string());
        }
    }

    fn untrack(&self, order_id: &str, user_id: Option<&str>) {
        self.order_to_symbol.write().remove(order_id);
        if let Some(user_id) = user_id {
            let mut users = self.user_orders.write();
            if let Some(orders) = users.get_mut(user_id) {
                orders.remove(order_id);
                if orders.is_empty() {
                    users.remove(user_id);
                }
            }
        }
    }
}

/// Keeps the registry indexes current from one child book's lifecycle events.
/// Runs inside the book's lock, so it only touches registry maps.
struct LifecycleTracker {
    symbol: String,
    index: Arc<RegistryIndex>,
}

impl LifecycleTracker {
    fn on_event(&self, event: &BookEvent) -> EventResult<()> {
        match &event.kind {
            EventKind::OrderAdded { order } => {
                self.index.track(&self.symbol, &order.order_id, order.user_id.as_deref());
            }
            EventKind::OrderCancelled { order_id, user_id, .. }
            | EventKind::OrderExpired { order_id, user_id, .. } => {
                self.index.untrack(order_id, user_id.as_deref());
            }
            EventKind::OrderFilled { order_id, user_id, remaining_quantity, .. } => {
                if remaining_quantity.is_zero() {
                    self.index.untrack(order_id, user_id.as_deref());
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Composes many order books, one per symbol.
#[derive(Debug, Default)]
pub struct MarketRegistry {
    books: RwLock<HashMap<String, Arc<OrderBook>>>,
    index: Arc<RegistryIndex>,
}

impl MarketRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        info!("market registry initialized");
        Self::default()
    }

    /// Creates a market from `config` and wires the registry's lifecycle
    /// tracking into its event bus.
    pub fn create(&self, config: BookConfig) -> RegistryResult<Arc<OrderBook>> {
        let symbol = config.symbol.clone();
        let mut books = self.books.write();
        if books.contains_key(&symbol) {
            return Err(RegistryError::MarketExists(symbol));
        }

        let book = Arc::new(OrderBook::new(config));
        let tracker = Arc::new(LifecycleTracker {
            symbol: symbol.clone(),
            index: Arc::clone(&self.index),
        });
        for event_type in [
            EventType::OrderAdded,
            EventType::OrderCancelled,
            EventType::OrderExpired,
            EventType::OrderFilled,
        ] {
            let tracker = Arc::clone(&tracker);
            book.event_bus().subscribe_fn(event_type, move |event| tracker.on_event(event));
        }

        books.insert(symbol.clone(), Arc::clone(&book));
        info!(%symbol, "market created");
        Ok(book)
    }

    /// Looks up a market by symbol.
    pub fn get(&self, symbol: &str) -> Option<Arc<OrderBook>> {
        self.books.read().get(symbol).cloned()
    }

    /// Whether a market exists for `symbol`.
    pub fn has(&self, symbol: &str) -> bool {
        self.books.read().contains_key(symbol)
    }

    /// Every market symbol, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.books.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Removes a market, dropping its orders and purging its index entries.
    pub fn remove(&self, symbol: &str) -> bool {
        let Some(book) = self.books.write().remove(symbol) else {
            return false;
        };
        book.stop_expiry_sweeper();

        let orphaned: Vec<String> = {
            let routes = self.index.order_to_symbol.read();
            routes
                .iter()
                .filter(|(_, owner)| owner.as_str() == symbol)
                .map(|(order_id, _)| order_id.clone())
                .collect()
        };
        for order_id in &orphaned {
            let user_id = book.order(order_id).and_then(|o| o.user_id);
            self.index.untrack(order_id, user_id.as_deref());
        }
        info!(%symbol, orders = orphaned.len(), "market removed");
        true
    }

    /// Submits an order to the market trading `symbol`.
    pub fn place(&self, symbol: &str, spec: OrderSpec) -> RegistryResult<SubmitReport> {
        let book = self
            .get(symbol)
            .ok_or_else(|| RegistryError::MarketNotFound(symbol.to_string()))?;
        Ok(book.submit(spec)?)
    }

    /// Cancels an order in whichever market owns it.
    pub fn cancel(&self, order_id: &str) -> RegistryResult<Order> {
        let book = self.route(order_id)?;
        Ok(book.cancel(order_id)?)
    }

    /// Modifies an order in whichever market owns it.
    pub fn modify(&self, order_id: &str, patch: OrderPatch) -> RegistryResult<ModifyReport> {
        let book = self.route(order_id)?;
        Ok(book.modify(order_id, patch)?)
    }

    /// A clone of a live order, wherever it rests.
    pub fn order(&self, order_id: &str) -> Option<Order> {
        let book = self.route(order_id).ok()?;
        book.order(order_id)
    }

    /// Every live order for `user_id` across all markets.
    pub fn user_orders(&self, user_id: &str) -> Vec<Order> {
        let order_ids: Vec<String> = self
            .index
            .user_orders
            .read()
            .get(user_id)
            .map(|orders| orders.iter().cloned().collect())
            .unwrap_or_default();
        let mut orders: Vec<Order> =
            order_ids.iter().filter_map(|id| self.order(id)).collect();
        orders.sort_by_key(|order| order.sequence);
        orders
    }

    /// A depth snapshot of one market.
    pub fn snapshot(&self, symbol: &str, depth: Option<usize>) -> RegistryResult<BookSnapshot> {
        let book = self
            .get(symbol)
            .ok_or_else(|| RegistryError::MarketNotFound(symbol.to_string()))?;
        Ok(book.snapshot(depth)?)
    }

    /// Sweeps expired orders across every market, one book lock at a time.
    pub fn sweep_expired(&self) -> usize {
        let books: Vec<Arc<OrderBook>> = self.books.read().values().cloned().collect();
        books.iter().map(|book| book.sweep_expired()).sum()
    }

    /// Removes every order from one market, keeping the market itself.
    pub fn clear_market(&self, symbol: &str) -> bool {
        let Some(book) = self.get(symbol) else {
            return false;
        };
        // clear() emits no per-order removals, so purge the routes directly.
        let orphaned: Vec<String> = {
            let routes = self.index.order_to_symbol.read();
            routes
                .iter()
                .filter(|(_, owner)| owner.as_str() == symbol)
                .map(|(order_id, _)| order_id.clone())
                .collect()
        };
        for order_id in &orphaned {
            let user_id = book.order(order_id).and_then(|o| o.user_id);
            self.index.untrack(order_id, user_id.as_deref());
        }
        book.clear();
        true
    }

    /// Aggregated statistics across every market.
    pub fn stats(&self) -> RegistryStatistics {
        let books: Vec<(String, Arc<OrderBook>)> = self
            .books
            .read()
            .iter()
            .map(|(symbol, book)| (symbol.clone(), Arc::clone(book)))
            .collect();
        let markets: BTreeMap<String, BookStatistics> = books
            .into_iter()
            .map(|(symbol, book)| (symbol, book.statistics()))
            .collect();
        RegistryStatistics {
            total_markets: markets.len(),
            total_open_orders: markets.values().map(|s| s.open_orders + s.parked_stops).sum(),
            total_users: self.index.user_orders.read().len(),
            markets,
        }
    }

    /// Starts the expiry sweeper on every market.
    pub fn start_expiry_sweepers(&self) {
        for book in self.books.read().values() {
            book.start_expiry_sweeper();
        }
    }

    fn route(&self, order_id: &str) -> RegistryResult<Arc<OrderBook>> {
        let symbol = self
            .index
            .order_to_symbol
            .read()
            .get(order_id)
            .cloned()
            .ok_or_else(|| RegistryError::OrderNotFound(order_id.to_string()))?;
        self.get(&symbol).ok_or_else(|| {
            warn!(%symbol, %order_id, "route points at a missing market");
            RegistryError::MarketNotFound(symbol)
        })
    }
}
