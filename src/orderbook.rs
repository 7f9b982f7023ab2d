//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the order book for a single trading instrument. It
// owns both side books, the order index, the stop table, the trade history
// ring, statistics and the expiry machinery, and serialises every operation
// behind one mutex so submissions, modifications, cancellations and snapshots
// each observe a consistent book. Lifecycle events are published synchronously
// on the book's event bus while the lock is held.
//
// | Component     | Description                                                               |
// |---------------|---------------------------------------------------------------------------|
// | OrderBook     | Public handle: submit/cancel/modify/snapshot/trades/statistics            |
// | BookCore      | Lock-protected state: side books, indexes, stops, history, expiry heap    |
// | SubmitReport  | Outcome of a submission: assigned id, trades, resting flag                |
// | ModifyReport  | Outcome of a modification, including whether priority was lost            |
//--------------------------------------------------------------------------------------------------

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::book::{DepthView, SideBook};
use crate::config::{BookConfig, TriggerSource};
use crate::depth::{BookSnapshot, DepthLevel};
use crate::events::{BookEvent, EventBus, EventKind};
use crate::matcher;
use crate::stats::{BookStatistics, LatencyMeter, OperationCounters};
use crate::types::{
    BookResult, CancelReason, Order, OrderBookError, OrderPatch, OrderSpec, OrderType, Side,
    TimeInForce, Trade,
};

/// Outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmitReport {
    /// The assigned (or client-supplied) order id.
    pub order_id: String,
    /// Trades executed on arrival, in execution order.
    pub trades: Vec<Trade>,
    /// Whether a remainder rested on the book (or parked as a stop).
    pub resting: bool,
}

/// Outcome of a successful modification.
#[derive(Debug, Clone)]
pub struct ModifyReport {
    /// Id of the modified order.
    pub order_id: String,
    /// Trades executed by the re-run cross check, if any.
    pub trades: Vec<Trade>,
    /// Whether the order still rests after the modification.
    pub resting: bool,
    /// Whether the change moved the order to the back of its queue.
    pub lost_priority: bool,
}

/// Lock-protected book state. One lock acquisition covers everything a single
/// operation touches, which is what makes each operation atomic.
#[derive(Debug)]
struct BookCore {
    bids: SideBook,
    asks: SideBook,
    /// order_id -> (side, resting price); O(1) route into the level queues.
    order_index: HashMap<String, (Side, Decimal)>,
    /// order_id -> (side, trigger price) for parked stops.
    stop_index: HashMap<String, (Side, Decimal)>,
    /// Parked buy stops keyed by trigger price. Vec order is submission order.
    stop_bids: BTreeMap<Decimal, Vec<Order>>,
    /// Parked sell stops keyed by trigger price.
    stop_asks: BTreeMap<Decimal, Vec<Order>>,
    trade_history: VecDeque<Trade>,
    last_trade_price: Option<Decimal>,
    next_sequence: u64,
    counters: OperationCounters,
    latency: LatencyMeter,
    /// Min-heap of (deadline, order_id). Entries may be stale; the sweep
    /// re-checks the live order before cancelling.
    expiry_heap: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
    poisoned: bool,
}

impl BookCore {
    fn new() -> Self {
        Self {
            bids: SideBook::new(Side::Buy),
            asks: SideBook::new(Side::Sell),
            order_index: HashMap::new(),
            stop_index: HashMap::new(),
            stop_bids: BTreeMap::new(),
            stop_asks: BTreeMap::new(),
            trade_history: VecDeque::new(),
            last_trade_price: None,
            next_sequence: 1,
            counters: OperationCounters::default(),
            latency: LatencyMeter::default(),
            expiry_heap: BinaryHeap::new(),
            poisoned: false,
        }
    }
}

#[derive(Debug)]
struct SweeperHandle {
    shutdown: Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// A price-time priority order book for one instrument.
///
/// All operations are safe to call from many threads; each serialises on the
/// book's internal lock. Event handlers registered on [`Self::event_bus`] run
/// on the mutating thread while that lock is held, so they must be fast and
/// must not call back into the book.
#[derive(Debug)]
pub struct OrderBook {
    config: BookConfig,
    events: EventBus,
    core: Mutex<BookCore>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl OrderBook {
    /// Creates an empty book from `config`.
    pub fn new(config: BookConfig) -> Self {
        info!(
            symbol = %config.symbol,
            price_precision = config.price_precision,
            quantity_precision = config.quantity_precision,
            "order book initialized"
        );
        Self {
            events: EventBus::new(config.max_event_history),
            core: Mutex::new(BookCore::new()),
            sweeper: Mutex::new(None),
            config,
        }
    }

    /// The symbol this book trades.
    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    /// The configuration this book was created with.
    pub fn config(&self) -> &BookConfig {
        &self.config
    }

    /// The bus this book publishes lifecycle events on.
    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Whether an internal invariant violation has poisoned this book.
    pub fn is_poisoned(&self) -> bool {
        self.core.lock().poisoned
    }

    //----------------------------------------------------------------------------------------------
    // Submission
    //----------------------------------------------------------------------------------------------

    /// Validates and processes one order: matches it against the opposing
    /// side, applies time-in-force handling and rests any remainder.
    pub fn submit(&self, spec: OrderSpec) -> BookResult<SubmitReport> {
        let started = Instant::now();
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.poisoned {
            return Err(OrderBookError::Poisoned);
        }
        let result = self.submit_locked(core, spec);
        core.latency.record("submit", started.elapsed());
        result
    }

    /// Processes a batch of orders under a single lock acquisition. Orders
    /// are matched against the pre-batch book first and rested afterwards, so
    /// an earlier entry never trades against a later one.
    pub fn submit_batch(&self, specs: Vec<OrderSpec>) -> Vec<BookResult<SubmitReport>> {
        let started = Instant::now();
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.poisoned {
            return specs.into_iter().map(|_| Err(OrderBookError::Poisoned)).collect();
        }

        let depth_before = self.depth_watermark(core);
        let mut reports = Vec::with_capacity(specs.len());
        let mut pending_rest = Vec::new();

        for spec in specs {
            let report = match self.validate(core, spec) {
                Ok(order) => {
                    if order.is_stop() && !self.stop_triggered(core, &order) {
                        Ok(self.park_stop(core, order))
                    } else {
                        let order = self.activate(order);
                        self.execute(core, order, true, false).map(|(report, residual)| {
                            if let Some(order) = residual {
                                pending_rest.push(order);
                            }
                            report
                        })
                    }
                }
                Err(err) => Err(err),
            };
            reports.push(report);
        }

        for order in pending_rest {
            self.rest(core, order, true);
        }
        self.trigger_stops(core);
        self.finish_mutation(core, depth_before);

        core.latency.record("submit_batch", started.elapsed());
        reports
    }

    fn submit_locked(&self, core: &mut BookCore, spec: OrderSpec) -> BookResult<SubmitReport> {
        let order = self.validate(core, spec)?;
        debug!(
            symbol = %self.config.symbol,
            order_id = %order.order_id,
            side = ?order.side,
            order_type = ?order.order_type,
            price = ?order.price,
            quantity = %order.quantity,
            tif = ?order.time_in_force,
            "submitting order"
        );

        if order.is_stop() && !self.stop_triggered(core, &order) {
            return Ok(self.park_stop(core, order));
        }

        let depth_before = self.depth_watermark(core);
        let order = self.activate(order);
        let (report, _) = self.execute(core, order, true, true)?;
        self.trigger_stops(core);
        self.finish_mutation(core, depth_before);
        Ok(report)
    }

    /// Builds a live [`Order`] from a spec, rejecting anything malformed
    /// before the book is touched.
    fn validate(&self, core: &mut BookCore, spec: OrderSpec) -> BookResult<Order> {
        let config = &self.config;

        if spec.quantity <= Decimal::ZERO {
            return Err(OrderBookError::InvalidQuantity { quantity: spec.quantity });
        }
        check_precision(spec.quantity, config.quantity_precision, "quantity")?;

        let mut price = spec.price;
        match spec.order_type {
            OrderType::Limit | OrderType::Iceberg | OrderType::StopLimit => {
                let limit = price.ok_or_else(|| {
                    OrderBookError::UnknownOrderType(format!(
                        "{:?} order requires a price",
                        spec.order_type
                    ))
                })?;
                if limit <= Decimal::ZERO {
                    return Err(OrderBookError::InvalidPrice { price: limit });
                }
                check_precision(limit, config.price_precision, "price")?;
            }
            OrderType::Market | OrderType::StopMarket => {
                // Market variants never carry a limit price.
                price = None;
            }
        }

        if matches!(spec.order_type, OrderType::StopLimit | OrderType::StopMarket) {
            let trigger = spec.stop_price.ok_or_else(|| {
                OrderBookError::UnknownOrderType(format!(
                    "{:?} order requires a stop price",
                    spec.order_type
                ))
            })?;
            if trigger <= Decimal::ZERO {
                return Err(OrderBookError::InvalidPrice { price: trigger });
            }
            check_precision(trigger, config.price_precision, "stop_price")?;
        }

        if let Some(displayed) = spec.displayed_quantity {
            if displayed <= Decimal::ZERO || displayed > spec.quantity {
                return Err(OrderBookError::InvalidQuantity { quantity: displayed });
            }
            check_precision(displayed, config.quantity_precision, "displayed_quantity")?;
        } else if spec.order_type == OrderType::Iceberg {
            return Err(OrderBookError::UnknownOrderType(
                "iceberg order requires a displayed quantity".to_string(),
            ));
        }

        if spec.post_only && matches!(spec.order_type, OrderType::Market | OrderType::StopMarket) {
            return Err(OrderBookError::UnknownOrderType(
                "post-only market order".to_string(),
            ));
        }

        let now = Utc::now();
        let expiry_time = match spec.time_in_force {
            TimeInForce::Gtd => {
                let expiry = spec.expiry_time.unwrap_or(DateTime::<Utc>::MIN_UTC);
                if expiry <= now {
                    return Err(OrderBookError::GtdExpiryInPast(expiry));
                }
                Some(expiry)
            }
            TimeInForce::Day => {
                let close = config.session_close.ok_or(OrderBookError::SessionCloseUnset)?;
                if close <= now {
                    return Err(OrderBookError::GtdExpiryInPast(close));
                }
                Some(close)
            }
            _ => None,
        };

        let order_id = match spec.order_id {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };
        if core.order_index.contains_key(&order_id) || core.stop_index.contains_key(&order_id) {
            return Err(OrderBookError::DuplicateOrderId(order_id));
        }

        let sequence = core.next_sequence;
        core.next_sequence += 1;

        Ok(Order {
            order_id,
            side: spec.side,
            order_type: spec.order_type,
            price,
            stop_price: spec.stop_price,
            quantity: spec.quantity,
            original_quantity: spec.quantity,
            displayed_quantity: spec.displayed_quantity,
            time_in_force: spec.time_in_force,
            expiry_time,
            post_only: spec.post_only,
            user_id: spec.user_id,
            submitted_at: now,
            sequence,
            trail_value: spec.trail_value,
            trail_is_percent: spec.trail_is_percent,
        })
    }

    /// Converts a triggered (or immediately-triggering) stop into its
    /// underlying order type. Non-stop orders pass through unchanged.
    fn activate(&self, mut order: Order) -> Order {
        match order.order_type {
            OrderType::StopLimit => order.order_type = OrderType::Limit,
            OrderType::StopMarket => {
                order.order_type = OrderType::Market;
                order.price = None;
            }
            _ => {}
        }
        order
    }

    /// Parks an untriggered stop in the stop table.
    fn park_stop(&self, core: &mut BookCore, order: Order) -> SubmitReport {
        // validate() guarantees a stop price on stop variants.
        let trigger = order.stop_price.unwrap_or_default();
        let table = match order.side {
            Side::Buy => &mut core.stop_bids,
            Side::Sell => &mut core.stop_asks,
        };
        core.stop_index.insert(order.order_id.clone(), (order.side, trigger));
        if let Some(expiry) = order.expiry_time {
            core.expiry_heap.push(Reverse((expiry, order.order_id.clone())));
        }
        core.counters.orders_added += 1;
        let report = SubmitReport { order_id: order.order_id.clone(), trades: vec![], resting: true };
        table.entry(trigger).or_default().push(order.clone());
        debug!(order_id = %order.order_id, %trigger, "stop order parked");
        self.emit(EventKind::OrderAdded { order });
        report
    }

    /// Runs the matching pass and time-in-force handling for an active
    /// (non-parked) order. When `rest_now` is false the caller receives the
    /// restable remainder instead, for deferred insertion (batches).
    fn execute(
        &self,
        core: &mut BookCore,
        mut order: Order,
        announce_add: bool,
        rest_now: bool,
    ) -> BookResult<(SubmitReport, Option<Order>)> {
        let opposing = match order.side {
            Side::Buy => &mut core.asks,
            Side::Sell => &mut core.bids,
        };

        if order.post_only {
            if let Some(price) = matcher::would_cross(&order, opposing) {
                core.counters.orders_rejected += 1;
                self.emit(EventKind::OrderRejected {
                    order_id: order.order_id.clone(),
                    reason: format!("post-only order would cross at {price}"),
                });
                return Err(OrderBookError::PostOnlyWouldCross { price });
            }
        }

        if order.time_in_force == TimeInForce::Fok {
            let available = matcher::fillable_quantity(&order, opposing);
            if available < order.quantity {
                core.counters.orders_rejected += 1;
                self.emit(EventKind::OrderRejected {
                    order_id: order.order_id.clone(),
                    reason: format!(
                        "fill-or-kill order unfillable: {available} available of {} required",
                        order.quantity
                    ),
                });
                return Err(OrderBookError::FokUnfillable {
                    available,
                    required: order.quantity,
                });
            }
        }

        let outcome = matcher::match_against(&mut order, opposing);
        let trades = self.apply_fills(core, &order, &outcome);

        let market_starved = order.order_type == OrderType::Market && !order.quantity.is_zero();
        if !outcome.fills.is_empty() {
            self.emit(EventKind::OrderFilled {
                order_id: order.order_id.clone(),
                user_id: order.user_id.clone(),
                fill_quantity: outcome.filled_quantity(),
                remaining_quantity: order.quantity,
                insufficient_liquidity: market_starved,
            });
        } else if market_starved {
            core.counters.orders_rejected += 1;
            self.emit(EventKind::OrderRejected {
                order_id: order.order_id.clone(),
                reason: "market order found no liquidity".to_string(),
            });
            return Ok((
                SubmitReport { order_id: order.order_id, trades, resting: false },
                None,
            ));
        }

        if order.time_in_force == TimeInForce::Ioc && !order.quantity.is_zero() {
            // Discard the remainder; announce it only when a partial fill happened.
            if !outcome.fills.is_empty() {
                core.counters.orders_cancelled += 1;
                self.emit(EventKind::OrderCancelled {
                    order_id: order.order_id.clone(),
                    user_id: order.user_id.clone(),
                    reason: CancelReason::IocRemainder,
                    remaining_quantity: order.quantity,
                });
            }
            return Ok((
                SubmitReport { order_id: order.order_id, trades, resting: false },
                None,
            ));
        }

        let restable = !order.quantity.is_zero()
            && order.order_type != OrderType::Market
            && order.time_in_force != TimeInForce::Fok;

        let report =
            SubmitReport { order_id: order.order_id.clone(), trades, resting: restable };
        if !restable {
            return Ok((report, None));
        }
        if rest_now {
            self.rest(core, order, announce_add);
            Ok((report, None))
        } else {
            Ok((report, Some(order)))
        }
    }

    /// Records trades and emits trade, maker-fill and level events for one
    /// matching pass.
    fn apply_fills(
        &self,
        core: &mut BookCore,
        taker: &Order,
        outcome: &matcher::MatchOutcome,
    ) -> Vec<Trade> {
        let mut trades = Vec::with_capacity(outcome.fills.len());
        for fill in &outcome.fills {
            let trade = Trade::new(
                &fill.maker.order_id,
                &taker.order_id,
                fill.price,
                fill.quantity,
                self.config.maker_fee_rate,
                self.config.taker_fee_rate,
                fill.maker.user_id.clone(),
                taker.user_id.clone(),
            );
            core.last_trade_price = Some(fill.price);
            core.counters.trades_executed += 1;
            core.counters.volume_traded += fill.quantity;
            if core.trade_history.len() == self.config.max_trade_history {
                core.trade_history.pop_front();
            }
            core.trade_history.push_back(trade.clone());

            self.emit(EventKind::TradeExecuted { trade: trade.clone() });
            self.emit(EventKind::OrderFilled {
                order_id: fill.maker.order_id.clone(),
                user_id: fill.maker.user_id.clone(),
                fill_quantity: fill.quantity,
                remaining_quantity: fill.maker.quantity,
                insufficient_liquidity: false,
            });
            if fill.maker.quantity.is_zero() {
                core.order_index.remove(&fill.maker.order_id);
            }
            trades.push(trade);
        }

        let maker_side = taker.side.opposite();
        for price in &outcome.removed_levels {
            self.emit(EventKind::PriceLevelRemoved { side: maker_side, price: *price });
        }
        for price in &outcome.touched_levels {
            let level = match maker_side {
                Side::Buy => core.bids.level(*price),
                Side::Sell => core.asks.level(*price),
            };
            if let Some(level) = level {
                self.emit(EventKind::PriceLevelChanged {
                    side: maker_side,
                    price: *price,
                    quantity: level.aggregate(DepthView::Displayed),
                    order_count: level.order_count(),
                });
            }
        }
        trades
    }

    /// Rests a remainder at the tail of its level's queue, indexing it and
    /// scheduling its expiry.
    fn rest(&self, core: &mut BookCore, order: Order, announce_add: bool) {
        let price = match order.price {
            Some(price) => price,
            None => {
                // Market orders never reach here; a priceless rest is an
                // invariant violation.
                let _ = self.poison(core, "restable order without a price");
                return;
            }
        };
        let side_book = match order.side {
            Side::Buy => &mut core.bids,
            Side::Sell => &mut core.asks,
        };
        let created = side_book.insert(price, order.clone());
        let (quantity, order_count) = {
            let level = side_book.level(price);
            (
                level.map(|l| l.aggregate(DepthView::Displayed)).unwrap_or_default(),
                level.map(|l| l.order_count()).unwrap_or_default(),
            )
        };
        core.order_index.insert(order.order_id.clone(), (order.side, price));
        if let Some(expiry) = order.expiry_time {
            core.expiry_heap.push(Reverse((expiry, order.order_id.clone())));
        }
        if announce_add {
            core.counters.orders_added += 1;
        }

        if created {
            self.emit(EventKind::PriceLevelAdded { side: order.side, price });
        } else {
            self.emit(EventKind::PriceLevelChanged {
                side: order.side,
                price,
                quantity,
                order_count,
            });
        }
        if announce_add {
            self.emit(EventKind::OrderAdded { order });
        }
    }

    //----------------------------------------------------------------------------------------------
    // Stop triggering
    //----------------------------------------------------------------------------------------------

    /// Whether `order`'s trigger condition already holds.
    fn stop_triggered(&self, core: &BookCore, order: &Order) -> bool {
        let reference = match self.config.trigger_source {
            TriggerSource::LastTrade => core.last_trade_price,
            TriggerSource::BestQuote => match order.side {
                Side::Buy => core.asks.best_price(),
                Side::Sell => core.bids.best_price(),
            },
        };
        let (Some(reference), Some(trigger)) = (reference, order.stop_price) else {
            return false;
        };
        match order.side {
            Side::Buy => reference >= trigger,
            Side::Sell => reference <= trigger,
        }
    }

    /// Re-evaluates the stop table after a matching pass and resubmits every
    /// triggered stop as its underlying type. Loops until no further stops
    /// fire, since a triggered stop's own trades can move the reference price.
    fn trigger_stops(&self, core: &mut BookCore) {
        loop {
            let triggered = self.collect_triggered(core);
            if triggered.is_empty() {
                break;
            }
            for stop in triggered {
                info!(
                    symbol = %self.config.symbol,
                    order_id = %stop.order_id,
                    trigger = ?stop.stop_price,
                    "stop order triggered"
                );
                let order = self.activate(stop);
                if let Err(err) = self.execute(core, order, false, true) {
                    warn!(%err, "triggered stop rejected");
                }
            }
        }
    }

    /// Drains every stop whose trigger condition holds, buys in ascending
    /// trigger order and sells descending. Within one trigger price the
    /// submission order is preserved.
    fn collect_triggered(&self, core: &mut BookCore) -> Vec<Order> {
        let mut triggered = Vec::new();

        let buy_reference = match self.config.trigger_source {
            TriggerSource::LastTrade => core.last_trade_price,
            TriggerSource::BestQuote => core.asks.best_price(),
        };
        if let Some(reference) = buy_reference {
            let due: Vec<Decimal> = core.stop_bids.range(..=reference).map(|(p, _)| *p).collect();
            for price in due {
                if let Some(mut stops) = core.stop_bids.remove(&price) {
                    for stop in &stops {
                        core.stop_index.remove(&stop.order_id);
                    }
                    triggered.append(&mut stops);
                }
            }
        }

        let sell_reference = match self.config.trigger_source {
            TriggerSource::LastTrade => core.last_trade_price,
            TriggerSource::BestQuote => core.bids.best_price(),
        };
        if let Some(reference) = sell_reference {
            let due: Vec<Decimal> = core.stop_asks.range(reference..).map(|(p, _)| *p).collect();
            for price in due.into_iter().rev() {
                if let Some(mut stops) = core.stop_asks.remove(&price) {
                    for stop in &stops {
                        core.stop_index.remove(&stop.order_id);
                    }
                    triggered.append(&mut stops);
                }
            }
        }

        triggered
    }

    //----------------------------------------------------------------------------------------------
    // Cancellation
    //----------------------------------------------------------------------------------------------

    /// Cancels an order (resting or parked) on client request.
    pub fn cancel(&self, order_id: &str) -> BookResult<Order> {
        let started = Instant::now();
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.poisoned {
            return Err(OrderBookError::Poisoned);
        }
        let depth_before = self.depth_watermark(core);
        let result = self.cancel_locked(core, order_id, CancelReason::User);
        if result.is_ok() {
            self.finish_mutation(core, depth_before);
        }
        core.latency.record("cancel", started.elapsed());
        result
    }

    /// Cancels a batch of orders under one lock acquisition. Returns each id
    /// with whether it was found and cancelled.
    pub fn cancel_batch(&self, order_ids: Vec<String>) -> Vec<(String, bool)> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.poisoned {
            return order_ids.into_iter().map(|id| (id, false)).collect();
        }
        let depth_before = self.depth_watermark(core);
        let results = order_ids
            .into_iter()
            .map(|id| {
                let cancelled = self.cancel_locked(core, &id, CancelReason::User).is_ok();
                (id, cancelled)
            })
            .collect();
        self.finish_mutation(core, depth_before);
        results
    }

    fn cancel_locked(
        &self,
        core: &mut BookCore,
        order_id: &str,
        reason: CancelReason,
    ) -> BookResult<Order> {
        if let Some((side, price)) = core.order_index.get(order_id).copied() {
            let side_book = match side {
                Side::Buy => &mut core.bids,
                Side::Sell => &mut core.asks,
            };
            let Some((order, emptied)) = side_book.remove(price, order_id) else {
                return Err(self.poison(core, "order index points at a missing order"));
            };
            core.order_index.remove(order_id);

            if emptied {
                self.emit(EventKind::PriceLevelRemoved { side, price });
            } else if let Some(level) = match side {
                Side::Buy => core.bids.level(price),
                Side::Sell => core.asks.level(price),
            } {
                self.emit(EventKind::PriceLevelChanged {
                    side,
                    price,
                    quantity: level.aggregate(DepthView::Displayed),
                    order_count: level.order_count(),
                });
            }
            self.announce_removal(core, &order, reason);
            return Ok(order);
        }

        if let Some((side, trigger)) = core.stop_index.remove(order_id) {
            let table = match side {
                Side::Buy => &mut core.stop_bids,
                Side::Sell => &mut core.stop_asks,
            };
            let Some(stops) = table.get_mut(&trigger) else {
                return Err(self.poison(core, "stop index points at a missing trigger level"));
            };
            let Some(position) = stops.iter().position(|o| o.order_id == order_id) else {
                return Err(self.poison(core, "stop index points at a missing stop order"));
            };
            let order = stops.remove(position);
            if stops.is_empty() {
                table.remove(&trigger);
            }
            self.announce_removal(core, &order, reason);
            return Ok(order);
        }

        Err(OrderBookError::NotFound(order_id.to_string()))
    }

    /// Counts and emits the terminal event for a cancel or expiry.
    fn announce_removal(&self, core: &mut BookCore, order: &Order, reason: CancelReason) {
        match reason {
            CancelReason::Expired => {
                core.counters.orders_expired += 1;
                self.emit(EventKind::OrderExpired {
                    order_id: order.order_id.clone(),
                    user_id: order.user_id.clone(),
                    remaining_quantity: order.quantity,
                });
            }
            reason => {
                core.counters.orders_cancelled += 1;
                self.emit(EventKind::OrderCancelled {
                    order_id: order.order_id.clone(),
                    user_id: order.user_id.clone(),
                    reason,
                    remaining_quantity: order.quantity,
                });
            }
        }
    }

    //----------------------------------------------------------------------------------------------
    // Modification
    //----------------------------------------------------------------------------------------------

    /// Atomically applies `patch` to a resting order.
    ///
    /// A price change or a quantity increase re-queues the order at the tail
    /// of its (possibly new) level and re-runs the cross check, so the
    /// modification itself can execute trades. A strict quantity decrease at
    /// an unchanged price keeps time priority; a zero quantity cancels; an
    /// expiry-only change reschedules without touching the queue.
    pub fn modify(&self, order_id: &str, patch: OrderPatch) -> BookResult<ModifyReport> {
        let started = Instant::now();
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.poisoned {
            return Err(OrderBookError::Poisoned);
        }
        let depth_before = self.depth_watermark(core);
        let result = self.modify_locked(core, order_id, patch);
        if result.is_ok() {
            self.trigger_stops(core);
            self.finish_mutation(core, depth_before);
        }
        core.latency.record("modify", started.elapsed());
        result
    }

    fn modify_locked(
        &self,
        core: &mut BookCore,
        order_id: &str,
        patch: OrderPatch,
    ) -> BookResult<ModifyReport> {
        if patch.is_empty() {
            return Err(OrderBookError::InvalidPatch("empty patch".to_string()));
        }

        let (side, price) = core
            .order_index
            .get(order_id)
            .copied()
            .ok_or_else(|| OrderBookError::NotFound(order_id.to_string()))?;
        let current = {
            let level = match side {
                Side::Buy => core.bids.level(price),
                Side::Sell => core.asks.level(price),
            };
            let Some(order) = level.and_then(|l| l.get(order_id)) else {
                return Err(self.poison(core, "order index points at a missing order"));
            };
            order.clone()
        };

        // Validate the whole patch before mutating anything.
        if let Some(new_price) = patch.price {
            if new_price <= Decimal::ZERO {
                return Err(OrderBookError::InvalidPrice { price: new_price });
            }
            check_precision(new_price, self.config.price_precision, "price")?;
        }
        if let Some(new_quantity) = patch.quantity {
            if new_quantity < Decimal::ZERO {
                return Err(OrderBookError::InvalidQuantity { quantity: new_quantity });
            }
            check_precision(new_quantity, self.config.quantity_precision, "quantity")?;
        }
        if let Some(new_expiry) = patch.expiry_time {
            if new_expiry <= Utc::now() {
                return Err(OrderBookError::GtdExpiryInPast(new_expiry));
            }
        }

        if patch.quantity == Some(Decimal::ZERO) {
            let order = self.cancel_locked(core, order_id, CancelReason::User)?;
            return Ok(ModifyReport {
                order_id: order.order_id,
                trades: vec![],
                resting: false,
                lost_priority: false,
            });
        }

        let new_price = patch.price.unwrap_or(price);
        let new_quantity = patch.quantity.unwrap_or(current.quantity);
        let price_changed = new_price != price;
        let quantity_increased = new_quantity > current.quantity;

        if !price_changed && !quantity_increased {
            // In-place update: the order keeps its position in the queue.
            let side_book = match side {
                Side::Buy => &mut core.bids,
                Side::Sell => &mut core.asks,
            };
            let mut updated = current.clone();
            if new_quantity < current.quantity {
                let Some(level) = side_book.level_mut(price) else {
                    return Err(self.poison(core, "order index points at a missing level"));
                };
                let Some(reduced) = level.reduce_order(order_id, new_quantity) else {
                    return Err(self.poison(core, "order vanished during in-place modify"));
                };
                updated = reduced;
                let (quantity, order_count) = {
                    let level = side_book.level(price);
                    (
                        level.map(|l| l.aggregate(DepthView::Displayed)).unwrap_or_default(),
                        level.map(|l| l.order_count()).unwrap_or_default(),
                    )
                };
                self.emit(EventKind::PriceLevelChanged { side, price, quantity, order_count });
            }
            if let Some(new_expiry) = patch.expiry_time {
                let Some(order) = side_book.level_mut(price).and_then(|l| l.get_mut(order_id))
                else {
                    return Err(self.poison(core, "order vanished during expiry modify"));
                };
                order.expiry_time = Some(new_expiry);
                updated.expiry_time = Some(new_expiry);
                core.expiry_heap.push(Reverse((new_expiry, order_id.to_string())));
            }
            core.counters.orders_modified += 1;
            self.emit(EventKind::OrderModified { order: updated, lost_priority: false });
            return Ok(ModifyReport {
                order_id: order_id.to_string(),
                trades: vec![],
                resting: true,
                lost_priority: false,
            });
        }

        // Re-queue: equivalent to cancel + re-insert at the tail of the new
        // level, under this same lock acquisition. Pre-check post-only so a
        // rejection leaves the resting order untouched.
        let mut candidate = current.clone();
        candidate.price = Some(new_price);
        candidate.quantity = new_quantity;
        if candidate.post_only {
            let opposing = match side {
                Side::Buy => &core.asks,
                Side::Sell => &core.bids,
            };
            if let Some(cross_price) = matcher::would_cross(&candidate, opposing) {
                return Err(OrderBookError::PostOnlyWouldCross { price: cross_price });
            }
        }

        let side_book = match side {
            Side::Buy => &mut core.bids,
            Side::Sell => &mut core.asks,
        };
        let Some((mut order, emptied)) = side_book.remove(price, order_id) else {
            return Err(self.poison(core, "order index points at a missing order"));
        };
        core.order_index.remove(order_id);
        if emptied {
            self.emit(EventKind::PriceLevelRemoved { side, price });
        } else if let Some(level) = match side {
            Side::Buy => core.bids.level(price),
            Side::Sell => core.asks.level(price),
        } {
            self.emit(EventKind::PriceLevelChanged {
                side,
                price,
                quantity: level.aggregate(DepthView::Displayed),
                order_count: level.order_count(),
            });
        }

        order.price = Some(new_price);
        order.quantity = new_quantity;
        order.original_quantity = new_quantity;
        if let Some(new_expiry) = patch.expiry_time {
            order.expiry_time = Some(new_expiry);
            core.expiry_heap.push(Reverse((new_expiry, order_id.to_string())));
        }
        order.sequence = core.next_sequence;
        core.next_sequence += 1;
        order.submitted_at = Utc::now();

        core.counters.orders_modified += 1;
        self.emit(EventKind::OrderModified { order: order.clone(), lost_priority: true });

        // The re-queued order runs the cross check again and may trade.
        let (report, _) = self.execute(core, order, false, true)?;
        Ok(ModifyReport {
            order_id: report.order_id,
            trades: report.trades,
            resting: report.resting,
            lost_priority: true,
        })
    }

    //----------------------------------------------------------------------------------------------
    // Queries
    //----------------------------------------------------------------------------------------------

    /// An immutable snapshot of the displayed depth, truncated to `depth`
    /// levels per side (`None` = all).
    pub fn snapshot(&self, depth: Option<usize>) -> BookResult<BookSnapshot> {
        self.snapshot_with_view(depth, DepthView::Displayed)
    }

    /// A snapshot under an explicit aggregation view.
    pub fn snapshot_with_view(
        &self,
        depth: Option<usize>,
        view: DepthView,
    ) -> BookResult<BookSnapshot> {
        let started = Instant::now();
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.poisoned {
            return Err(OrderBookError::Poisoned);
        }
        let snapshot = BookSnapshot::new(
            self.config.symbol.clone(),
            core.bids.depth(depth, view),
            core.asks.depth(depth, view),
        );
        self.emit(EventKind::SnapshotCreated { depth });
        core.latency.record("snapshot", started.elapsed());
        Ok(snapshot)
    }

    /// Up to `limit` most recent trades, newest first.
    pub fn trades(&self, limit: usize) -> Vec<Trade> {
        let core = self.core.lock();
        core.trade_history.iter().rev().take(limit).cloned().collect()
    }

    /// A clone of a live order: resting on the book or parked as a stop.
    pub fn order(&self, order_id: &str) -> Option<Order> {
        let core = self.core.lock();
        if let Some((side, price)) = core.order_index.get(order_id) {
            let level = match side {
                Side::Buy => core.bids.level(*price),
                Side::Sell => core.asks.level(*price),
            };
            return level.and_then(|l| l.get(order_id)).cloned();
        }
        let (side, trigger) = core.stop_index.get(order_id)?;
        let table = match side {
            Side::Buy => &core.stop_bids,
            Side::Sell => &core.stop_asks,
        };
        table.get(trigger)?.iter().find(|o| o.order_id == order_id).cloned()
    }

    /// The displayed aggregate at one price, if the level exists.
    pub fn depth_at(&self, side: Side, price: Decimal) -> Option<DepthLevel> {
        let core = self.core.lock();
        let side_book = match side {
            Side::Buy => &core.bids,
            Side::Sell => &core.asks,
        };
        side_book.level(price).map(|level| DepthLevel {
            price,
            quantity: level.aggregate(DepthView::Displayed),
            order_count: level.order_count(),
        })
    }

    /// The best (highest) bid price.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.core.lock().bids.best_price()
    }

    /// The best (lowest) ask price.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.core.lock().asks.best_price()
    }

    /// Best ask minus best bid.
    pub fn spread(&self) -> Option<Decimal> {
        let core = self.core.lock();
        match (core.asks.best_price(), core.bids.best_price()) {
            (Some(ask), Some(bid)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Midpoint of best bid and best ask.
    pub fn mid_price(&self) -> Option<Decimal> {
        let core = self.core.lock();
        match (core.asks.best_price(), core.bids.best_price()) {
            (Some(ask), Some(bid)) => Some((ask + bid) / Decimal::TWO),
            _ => None,
        }
    }

    /// The price of the most recent trade.
    pub fn last_trade_price(&self) -> Option<Decimal> {
        self.core.lock().last_trade_price
    }

    /// Point-in-time statistics and latency summaries.
    pub fn statistics(&self) -> BookStatistics {
        let core = self.core.lock();
        let best_bid = core.bids.best_price();
        let best_ask = core.asks.best_price();
        BookStatistics {
            symbol: self.config.symbol.clone(),
            counters: core.counters.clone(),
            bid_levels: core.bids.len(),
            ask_levels: core.asks.len(),
            open_orders: core.order_index.len(),
            parked_stops: core.stop_index.len(),
            best_bid,
            best_ask,
            spread: match (best_ask, best_bid) {
                (Some(ask), Some(bid)) => Some(ask - bid),
                _ => None,
            },
            mid_price: match (best_ask, best_bid) {
                (Some(ask), Some(bid)) => Some((ask + bid) / Decimal::TWO),
                _ => None,
            },
            trade_history_size: core.trade_history.len(),
            latencies: core.latency.summaries(),
        }
    }

    /// Removes every order, trade and parked stop, resetting counters. The
    /// event bus and its history survive.
    pub fn clear(&self) {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        info!(symbol = %self.config.symbol, "clearing order book");
        let depth_before = self.depth_watermark(core);
        *core = BookCore::new();
        self.finish_mutation(core, depth_before);
    }

    //----------------------------------------------------------------------------------------------
    // Expiry
    //----------------------------------------------------------------------------------------------

    /// Drains every due entry from the expiry heap and cancels the orders
    /// that are genuinely expired. Stale heap entries (client-cancelled or
    /// rescheduled orders) are dropped silently, which makes the sweep
    /// idempotent. Returns the number of orders removed.
    pub fn sweep_expired(&self) -> usize {
        let started = Instant::now();
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.poisoned {
            return 0;
        }
        let depth_before = self.depth_watermark(core);
        let now = Utc::now();
        let mut removed = 0;

        loop {
            match core.expiry_heap.peek() {
                Some(Reverse((deadline, _))) if *deadline <= now => {}
                _ => break,
            }
            let Some(Reverse((deadline, order_id))) = core.expiry_heap.pop() else {
                break;
            };
            let live_expiry = self.live_expiry(core, &order_id);
            match live_expiry {
                Some(expiry) if expiry == deadline => {
                    if self.cancel_locked(core, &order_id, CancelReason::Expired).is_ok() {
                        removed += 1;
                        info!(symbol = %self.config.symbol, %order_id, "order expired");
                    }
                }
                // Rescheduled (a fresher heap entry exists) or already gone.
                _ => {}
            }
        }

        if removed > 0 {
            self.finish_mutation(core, depth_before);
        }
        core.latency.record("sweep_expired", started.elapsed());
        removed
    }

    fn live_expiry(&self, core: &BookCore, order_id: &str) -> Option<DateTime<Utc>> {
        if let Some((side, price)) = core.order_index.get(order_id) {
            let level = match side {
                Side::Buy => core.bids.level(*price),
                Side::Sell => core.asks.level(*price),
            };
            return level.and_then(|l| l.get(order_id)).and_then(|o| o.expiry_time);
        }
        let (side, trigger) = core.stop_index.get(order_id)?;
        let table = match side {
            Side::Buy => &core.stop_bids,
            Side::Sell => &core.stop_asks,
        };
        table
            .get(trigger)?
            .iter()
            .find(|o| o.order_id == order_id)
            .and_then(|o| o.expiry_time)
    }

    /// Starts the background sweeper thread, waking every
    /// `check_expiry_interval`. A zero interval disables sweeping.
    pub fn start_expiry_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            warn!(symbol = %self.config.symbol, "expiry sweeper already running");
            return;
        }
        let interval = self.config.check_expiry_interval;
        if interval.is_zero() {
            info!(symbol = %self.config.symbol, "expiry sweeping disabled");
            return;
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let weak = Arc::downgrade(self);
        let symbol = self.config.symbol.clone();
        let spawned = thread::Builder::new()
            .name(format!("expiry-{symbol}"))
            .spawn(move || {
                info!(%symbol, "expiry sweeper started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(book) = weak.upgrade() else { break };
                            let swept = book.sweep_expired();
                            if swept > 0 {
                                debug!(%symbol, swept, "expiry sweep removed orders");
                            }
                        }
                        _ => break,
                    }
                }
                info!(%symbol, "expiry sweeper stopped");
            });

        match spawned {
            Ok(handle) => {
                *sweeper = Some(SweeperHandle { shutdown: shutdown_tx, thread: handle })
            }
            Err(err) => error!(symbol = %self.config.symbol, %err, "failed to spawn expiry sweeper"),
        }
    }

    /// Stops the background sweeper, if one is running.
    pub fn stop_expiry_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.shutdown.send(());
            let _ = handle.thread.join();
        }
    }

    //----------------------------------------------------------------------------------------------
    // Internals
    //----------------------------------------------------------------------------------------------

    fn emit(&self, kind: EventKind) {
        self.events.publish(BookEvent::new(self.config.symbol.clone(), kind));
    }

    fn depth_watermark(&self, core: &BookCore) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        let top = Some(self.config.depth_event_levels);
        (
            core.bids.depth(top, DepthView::Displayed),
            core.asks.depth(top, DepthView::Displayed),
        )
    }

    /// Emits the trailing BookUpdated event for a mutation, plus DepthChanged
    /// when the watched top levels moved.
    fn finish_mutation(&self, core: &BookCore, before: (Vec<DepthLevel>, Vec<DepthLevel>)) {
        self.emit(EventKind::BookUpdated {
            best_bid: core.bids.best_price(),
            best_ask: core.asks.best_price(),
        });
        let after = self.depth_watermark(core);
        if after != before {
            self.emit(EventKind::DepthChanged { bids: after.0, asks: after.1 });
        }
    }

    /// Marks the book unusable after an internal invariant violation. Every
    /// later operation fails with `Poisoned` until external recovery.
    fn poison(&self, core: &mut BookCore, message: &str) -> OrderBookError {
        core.poisoned = true;
        error!(symbol = %self.config.symbol, detail = message, "internal invariant violated; book poisoned");
        OrderBookError::Poisoned
    }
}

impl Drop for OrderBook {
    fn drop(&mut self) {
        // The sweeper holds only a weak handle, so it would exit on its next
        // tick anyway; shutting it down here just makes drop deterministic.
        self.stop_expiry_sweeper();
    }
}

fn check_precision(value: Decimal, precision: u32, field: &'static str) -> BookResult<()> {
    if value.round_dp(precision) != value {
        return Err(OrderBookError::InvalidPrecision { field, value, precision });
    }
    Ok(())
}
