//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements one side of a limit order book: price levels holding
// FIFO queues of resting orders, and the sorted map of levels for that side.
//
// | Component     | Description                                                               |
// |---------------|---------------------------------------------------------------------------|
// | PriceLevel    | FIFO queue of resting orders at one price, with aggregate caches          |
// | SideBook      | Sorted price -> PriceLevel map; best-first traversal per side             |
// | DepthView     | Aggregation mode: displayed (iceberg-aware) or full quantities            |
//--------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::depth::DepthLevel;
use crate::types::{Order, Side};

/// Which quantity a depth aggregation exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthView {
    /// Sum of visible slices: icebergs contribute `min(peak, remaining)`.
    /// The default view for snapshots.
    Displayed,
    /// Sum of true remaining quantities.
    Full,
}

/// Maintains the FIFO queue of resting orders at a single price, along with
/// cached aggregates so depth queries never walk the queue.
///
/// The head of the queue is the oldest order and therefore the first to fill.
#[derive(Debug, Clone)]
pub struct PriceLevel {
    /// The price for this level.
    pub price: Decimal,
    /// The side this level rests on.
    pub side: Side,
    orders: VecDeque<Order>,
    total_quantity: Decimal,
    total_displayed: Decimal,
}

impl PriceLevel {
    fn new(price: Decimal, side: Side) -> Self {
        Self {
            price,
            side,
            orders: VecDeque::new(),
            total_quantity: Decimal::ZERO,
            total_displayed: Decimal::ZERO,
        }
    }

    /// Appends an order at the tail of the queue (lowest time priority).
    fn push_back(&mut self, order: Order) {
        self.total_quantity += order.quantity;
        self.total_displayed += order.visible_quantity();
        self.orders.push_back(order);
    }

    /// The next order to fill, without removing it.
    pub fn front(&self) -> Option<&Order> {
        self.orders.front()
    }

    /// Looks up an order in this level by id.
    pub fn get(&self, order_id: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.order_id == order_id)
    }

    pub(crate) fn get_mut(&mut self, order_id: &str) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.order_id == order_id)
    }

    /// Fills up to `max_quantity` against the head order, keeping the
    /// aggregates consistent. Returns a post-fill snapshot of the maker and
    /// the filled quantity; a fully filled maker is removed from the queue.
    pub(crate) fn fill_front(&mut self, max_quantity: Decimal) -> Option<(Order, Decimal)> {
        let maker = self.orders.front_mut()?;
        let fill_quantity = max_quantity.min(maker.quantity);
        let displayed_before = maker.visible_quantity();

        maker.quantity -= fill_quantity;
        let displayed_after = maker.visible_quantity();

        self.total_quantity -= fill_quantity;
        self.total_displayed -= displayed_before - displayed_after;

        let snapshot = maker.clone();
        if snapshot.quantity.is_zero() {
            self.orders.pop_front();
        }
        Some((snapshot, fill_quantity))
    }

    /// Removes an order from this level by id, keeping aggregates consistent.
    fn remove(&mut self, order_id: &str) -> Option<Order> {
        let position = self.orders.iter().position(|o| o.order_id == order_id)?;
        let order = self.orders.remove(position)?;
        self.total_quantity -= order.quantity;
        self.total_displayed -= order.visible_quantity();
        Some(order)
    }

    /// Reduces an order's remaining quantity in place. The order keeps its
    /// position in the queue, i.e. its time priority.
    pub(crate) fn reduce_order(&mut self, order_id: &str, new_quantity: Decimal) -> Option<Order> {
        let order = self.orders.iter_mut().find(|o| o.order_id == order_id)?;
        let displayed_before = order.visible_quantity();
        let delta = order.quantity - new_quantity;

        order.quantity = new_quantity;
        self.total_quantity -= delta;
        self.total_displayed -= displayed_before - order.visible_quantity();
        Some(order.clone())
    }

    /// Number of live orders at this price.
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// True when no orders rest at this price.
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Aggregate quantity under the given view.
    pub fn aggregate(&self, view: DepthView) -> Decimal {
        match view {
            DepthView::Displayed => self.total_displayed,
            DepthView::Full => self.total_quantity,
        }
    }

    /// Iterates the resting orders from highest to lowest time priority.
    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter()
    }

    fn as_depth(&self, view: DepthView) -> DepthLevel {
        DepthLevel {
            price: self.price,
            quantity: self.aggregate(view),
            order_count: self.order_count(),
        }
    }
}

/// One side of the book: a sorted map of price -> [`PriceLevel`] where the
/// best price is the highest for bids and the lowest for asks.
///
/// A level is created on the first insert at its price and removed in the
/// same critical section that empties it, so an existing level always holds
/// at least one order.
#[derive(Debug, Clone)]
pub struct SideBook {
    side: Side,
    levels: BTreeMap<Decimal, PriceLevel>,
}

impl SideBook {
    /// Creates an empty side.
    pub fn new(side: Side) -> Self {
        Self { side, levels: BTreeMap::new() }
    }

    /// The side this book holds.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Appends `order` at the tail of the queue at `order.price`, creating the
    /// level if absent. Returns true when a new level was created.
    ///
    /// The caller guarantees the order carries a limit price; market orders
    /// never rest.
    pub fn insert(&mut self, price: Decimal, order: Order) -> bool {
        let mut created = false;
        let level = self.levels.entry(price).or_insert_with(|| {
            created = true;
            PriceLevel::new(price, self.side)
        });
        level.push_back(order);
        created
    }

    /// Removes an order from its level. Returns the removed order and whether
    /// the level emptied (and was therefore removed from the book).
    pub fn remove(&mut self, price: Decimal, order_id: &str) -> Option<(Order, bool)> {
        let level = self.levels.get_mut(&price)?;
        let order = level.remove(order_id)?;
        let emptied = level.is_empty();
        if emptied {
            self.levels.remove(&price);
        }
        Some((order, emptied))
    }

    /// The best price on this side: highest bid, lowest ask.
    pub fn best_price(&self) -> Option<Decimal> {
        match self.side {
            Side::Buy => self.levels.keys().next_back().copied(),
            Side::Sell => self.levels.keys().next().copied(),
        }
    }

    /// Peeks at the best-price level.
    pub fn best(&self) -> Option<&PriceLevel> {
        self.best_price().and_then(|price| self.levels.get(&price))
    }

    /// Looks up the level at `price`.
    pub fn level(&self, price: Decimal) -> Option<&PriceLevel> {
        self.levels.get(&price)
    }

    pub(crate) fn level_mut(&mut self, price: Decimal) -> Option<&mut PriceLevel> {
        self.levels.get_mut(&price)
    }

    /// Drops the level at `price` if it holds no orders. Returns true when a
    /// level was removed.
    pub(crate) fn remove_level_if_empty(&mut self, price: Decimal) -> bool {
        if self.levels.get(&price).is_some_and(|level| level.is_empty()) {
            self.levels.remove(&price);
            return true;
        }
        false
    }

    /// Iterates levels in matching order: best price first.
    pub fn iter_from_best(&self) -> Box<dyn Iterator<Item = &PriceLevel> + '_> {
        match self.side {
            Side::Buy => Box::new(self.levels.values().rev()),
            Side::Sell => Box::new(self.levels.values()),
        }
    }

    /// The top `limit` levels as depth entries, best price first. `None`
    /// returns every level.
    pub fn depth(&self, limit: Option<usize>, view: DepthView) -> Vec<DepthLevel> {
        let take = limit.unwrap_or(usize::MAX);
        self.iter_from_best().take(take).map(|level| level.as_depth(view)).collect()
    }

    /// Number of price levels on this side.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// True when no orders rest on this side.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Total number of resting orders across all levels.
    pub fn total_orders(&self) -> usize {
        self.levels.values().map(|level| level.order_count()).sum()
    }
}
