//--------------------------------------------------------------------------------------------------
// INTEGRATION TESTS
//--------------------------------------------------------------------------------------------------
// End-to-end scenarios against the public API: the canonical matching
// scenarios (simple cross, price improvement, partial fill, IOC, FOK,
// modify priority), the book-wide invariants (price-time priority, quantity
// conservation, level cleanup, snapshot determinism, event causal order),
// and multi-market routing through the registry.
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use coralbook::{
    BookConfig, BookEvent, CancelReason, EventKind, EventType, MarketRegistry, OrderBook,
    OrderPatch, OrderSpec, Side, TimeInForce,
};

fn book() -> OrderBook {
    OrderBook::new(BookConfig::new("BTC/USD"))
}

fn limit(side: Side, price: Decimal, quantity: Decimal) -> OrderSpec {
    OrderSpec::limit(side, price, quantity)
}

fn record_events(book: &OrderBook) -> Arc<Mutex<Vec<BookEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    book.event_bus().subscribe_all_fn(move |event| {
        sink.lock().push(event.clone());
        Ok(())
    });
    seen
}

//--------------------------------------------------------------------------------------------------
// Canonical scenarios
//--------------------------------------------------------------------------------------------------

#[test]
fn scenario_simple_cross() {
    let book = book();
    book.submit(limit(Side::Sell, dec!(100.00), dec!(1.0)).with_order_id("a")).unwrap();
    let report = book.submit(limit(Side::Buy, dec!(100.00), dec!(1.0)).with_order_id("b")).unwrap();

    assert_eq!(report.trades.len(), 1);
    let trade = &report.trades[0];
    assert_eq!(trade.maker_order_id, "a");
    assert_eq!(trade.taker_order_id, "b");
    assert_eq!(trade.price, dec!(100.00));
    assert_eq!(trade.quantity, dec!(1.0));
    assert_eq!(trade.maker_fee, dec!(0));
    assert_eq!(trade.taker_fee, dec!(0));

    let snapshot = book.snapshot(None).unwrap();
    assert!(snapshot.bids.is_empty());
    assert!(snapshot.asks.is_empty());
}

#[test]
fn scenario_price_improvement() {
    let book = book();
    book.submit(limit(Side::Sell, dec!(99.00), dec!(1.0)).with_order_id("a")).unwrap();
    book.submit(limit(Side::Sell, dec!(100.00), dec!(1.0)).with_order_id("b")).unwrap();
    let report = book.submit(limit(Side::Buy, dec!(100.00), dec!(1.0)).with_order_id("c")).unwrap();

    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].maker_order_id, "a");
    assert_eq!(report.trades[0].price, dec!(99.00));
    assert_eq!(report.trades[0].quantity, dec!(1.0));

    // `b` remains resting.
    assert!(book.order("b").is_some());
    assert_eq!(book.best_ask(), Some(dec!(100.00)));
}

#[test]
fn scenario_partial_fill_then_rest() {
    let book = book();
    book.submit(limit(Side::Sell, dec!(100.00), dec!(2.0)).with_order_id("a")).unwrap();
    let report = book.submit(limit(Side::Buy, dec!(100.00), dec!(3.0)).with_order_id("b")).unwrap();

    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].quantity, dec!(2.0));
    assert!(report.resting);

    let resting = book.order("b").unwrap();
    assert_eq!(resting.side, Side::Buy);
    assert_eq!(resting.quantity, dec!(1.0));
    assert_eq!(book.best_bid(), Some(dec!(100.00)));
    assert_eq!(book.best_ask(), None);
}

#[test]
fn scenario_ioc_remainder_cancelled() {
    let book = book();
    let events = record_events(&book);
    book.submit(limit(Side::Sell, dec!(100.00), dec!(2.0)).with_order_id("a")).unwrap();
    let report = book
        .submit(
            limit(Side::Buy, dec!(100.00), dec!(3.0))
                .with_order_id("b")
                .with_time_in_force(TimeInForce::Ioc),
        )
        .unwrap();

    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].quantity, dec!(2.0));
    assert!(!report.resting);
    assert!(book.order("b").is_none());

    let cancel = events
        .lock()
        .iter()
        .find_map(|event| match &event.kind {
            EventKind::OrderCancelled { order_id, reason, remaining_quantity, .. }
                if order_id == "b" =>
            {
                Some((*reason, *remaining_quantity))
            }
            _ => None,
        })
        .expect("IOC remainder should announce a cancellation");
    assert_eq!(cancel, (CancelReason::IocRemainder, dec!(1.0)));
}

#[test]
fn scenario_fok_rejection_is_atomic() {
    let book = book();
    book.submit(limit(Side::Sell, dec!(100.00), dec!(1.0))).unwrap();
    book.submit(limit(Side::Sell, dec!(101.00), dec!(1.0))).unwrap();

    let before = book.snapshot(None).unwrap();
    let events = record_events(&book);

    let err = book
        .submit(
            limit(Side::Buy, dec!(100.50), dec!(2.0))
                .with_order_id("fok")
                .with_time_in_force(TimeInForce::Fok),
        )
        .unwrap_err();
    assert!(matches!(err, coralbook::OrderBookError::FokUnfillable { .. }));

    let after = book.snapshot(None).unwrap();
    assert!(before.same_depth(&after));
    assert!(book.trades(10).is_empty());

    let rejected = events
        .lock()
        .iter()
        .any(|event| matches!(&event.kind, EventKind::OrderRejected { order_id, .. } if order_id == "fok"));
    assert!(rejected);
}

#[test]
fn scenario_modify_priority_rules() {
    let book = book();
    book.submit(limit(Side::Sell, dec!(100.00), dec!(1.0)).with_order_id("a")).unwrap();
    book.submit(limit(Side::Sell, dec!(100.00), dec!(1.0)).with_order_id("b")).unwrap();

    // Price change away and back: `a` requeues behind `b`.
    book.modify("a", OrderPatch::price(dec!(99.99))).unwrap();
    book.modify("a", OrderPatch::price(dec!(100.00))).unwrap();

    let report = book.submit(limit(Side::Buy, dec!(100.00), dec!(1.0))).unwrap();
    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].maker_order_id, "b");

    // `a` is still on the book, alone at its level.
    assert!(book.order("a").is_some());
    assert!(book.order("b").is_none());
}

//--------------------------------------------------------------------------------------------------
// Invariants
//--------------------------------------------------------------------------------------------------

#[test]
fn invariant_price_time_priority() {
    let book = book();
    // Three makers at the same price, submitted in order.
    for id in ["m1", "m2", "m3"] {
        book.submit(limit(Side::Sell, dec!(100.00), dec!(1.0)).with_order_id(id)).unwrap();
    }
    // A better-priced maker arrives last but fills first.
    book.submit(limit(Side::Sell, dec!(99.00), dec!(1.0)).with_order_id("better")).unwrap();

    let report = book.submit(limit(Side::Buy, dec!(100.00), dec!(4.0))).unwrap();
    let makers: Vec<&str> = report.trades.iter().map(|t| t.maker_order_id.as_str()).collect();
    assert_eq!(makers, vec!["better", "m1", "m2", "m3"]);
}

#[test]
fn invariant_quantity_conservation() {
    let book = book();
    book.submit(limit(Side::Sell, dec!(100.00), dec!(1.5))).unwrap();
    book.submit(limit(Side::Sell, dec!(100.50), dec!(0.7))).unwrap();
    book.submit(limit(Side::Sell, dec!(101.00), dec!(2.0))).unwrap();

    // Taker for 3.0 at 100.50 can reach only the first two levels (2.2).
    let report = book.submit(
        limit(Side::Buy, dec!(100.50), dec!(3.0)).with_time_in_force(TimeInForce::Ioc),
    )
    .unwrap();
    let filled: Decimal = report.trades.iter().map(|t| t.quantity).sum();
    assert_eq!(filled, dec!(2.2));

    // The unreachable level is untouched.
    assert_eq!(book.best_ask(), Some(dec!(101.00)));
    let snapshot = book.snapshot(None).unwrap();
    assert_eq!(snapshot.asks[0].quantity, dec!(2.0));
}

#[test]
fn invariant_best_price_monotonic_under_matching() {
    let book = book();
    for (price, quantity) in [(dec!(100.00), dec!(1.0)), (dec!(101.00), dec!(1.0)), (dec!(102.00), dec!(1.0))] {
        book.submit(limit(Side::Sell, price, quantity)).unwrap();
    }

    let mut previous_best = book.best_ask().unwrap();
    for _ in 0..2 {
        book.submit(
            limit(Side::Buy, dec!(102.00), dec!(1.0)).with_time_in_force(TimeInForce::Ioc),
        )
        .unwrap();
        let best = book.best_ask().unwrap();
        assert!(best > previous_best);
        previous_best = best;
    }
}

#[test]
fn invariant_level_cleanup() {
    let book = book();
    book.submit(limit(Side::Buy, dec!(100.00), dec!(1.0)).with_order_id("b1")).unwrap();
    book.submit(limit(Side::Buy, dec!(100.00), dec!(1.0)).with_order_id("b2")).unwrap();

    book.cancel("b1").unwrap();
    let snapshot = book.snapshot(None).unwrap();
    assert_eq!(snapshot.bids.len(), 1);
    assert_eq!(snapshot.bids[0].order_count, 1);

    book.cancel("b2").unwrap();
    let snapshot = book.snapshot(None).unwrap();
    assert!(snapshot.bids.is_empty());
}

#[test]
fn invariant_snapshot_determinism() {
    let book = book();
    for (side, price) in [
        (Side::Buy, dec!(99.00)),
        (Side::Buy, dec!(98.50)),
        (Side::Sell, dec!(101.00)),
        (Side::Sell, dec!(102.00)),
    ] {
        book.submit(limit(side, price, dec!(1.0))).unwrap();
    }

    let a = book.snapshot(None).unwrap();
    let b = book.snapshot(None).unwrap();
    assert!(a.same_depth(&b));

    // Byte-identical wire form for the depth arrays.
    let a_json = serde_json::to_value(&a).unwrap();
    let b_json = serde_json::to_value(&b).unwrap();
    assert_eq!(a_json["bids"], b_json["bids"]);
    assert_eq!(a_json["asks"], b_json["asks"]);
}

#[test]
fn invariant_event_causal_order_per_order() {
    let book = book();
    let events = record_events(&book);

    book.submit(limit(Side::Sell, dec!(100.00), dec!(3.0)).with_order_id("a")).unwrap();
    book.modify("a", OrderPatch::quantity(dec!(2.0))).unwrap();
    book.submit(limit(Side::Buy, dec!(100.00), dec!(1.0))).unwrap();
    book.cancel("a").unwrap();

    let about_a: Vec<EventType> = events
        .lock()
        .iter()
        .filter(|event| match &event.kind {
            EventKind::OrderAdded { order } => order.order_id == "a",
            EventKind::OrderModified { order, .. } => order.order_id == "a",
            EventKind::OrderFilled { order_id, .. } => order_id == "a",
            EventKind::OrderCancelled { order_id, .. } => order_id == "a",
            EventKind::OrderExpired { order_id, .. } => order_id == "a",
            _ => false,
        })
        .map(|event| event.event_type())
        .collect();
    assert_eq!(
        about_a,
        vec![
            EventType::OrderAdded,
            EventType::OrderModified,
            EventType::OrderFilled,
            EventType::OrderCancelled,
        ]
    );
}

#[test]
fn invariant_event_history_queryable() {
    let book = book();
    book.submit(limit(Side::Sell, dec!(100.00), dec!(1.0))).unwrap();
    book.submit(limit(Side::Buy, dec!(100.00), dec!(1.0))).unwrap();

    let trades = book.event_bus().history(10, Some(EventType::TradeExecuted), None);
    assert_eq!(trades.len(), 1);
    let all = book.event_bus().history(100, None, Some("BTC/USD"));
    assert!(all.len() > trades.len());
    assert!(book.event_bus().history(100, None, Some("ETH/USD")).is_empty());
}

//--------------------------------------------------------------------------------------------------
// Fees and wire conventions
//--------------------------------------------------------------------------------------------------

#[test]
fn fees_accrue_decimally() {
    let book = OrderBook::new(BookConfig::new("BTC/USD").with_fees(dec!(0.001), dec!(0.002)));
    book.submit(limit(Side::Sell, dec!(20000.00), dec!(0.3)).with_user("maker")).unwrap();
    let report = book
        .submit(limit(Side::Buy, dec!(20000.00), dec!(0.3)).with_user("taker"))
        .unwrap();

    let trade = &report.trades[0];
    // 20000 * 0.3 = 6000 notional.
    assert_eq!(trade.maker_fee, dec!(6.0));
    assert_eq!(trade.taker_fee, dec!(12.0));
    assert_eq!(trade.maker_fee_rate, dec!(0.001));
    assert_eq!(trade.taker_fee_rate, dec!(0.002));
}

#[test]
fn wire_sentinel_market_orders() {
    let book = book();
    book.submit(limit(Side::Sell, dec!(100.00), dec!(1.0))).unwrap();

    // Legacy visualizer convention: a buy at +inf is a market buy.
    let spec = OrderSpec::from_wire(Side::Buy, f64::INFINITY, 1.0).unwrap();
    let report = book.submit(spec).unwrap();
    assert_eq!(report.trades.len(), 1);
    assert!(!report.resting);

    book.submit(limit(Side::Buy, dec!(99.00), dec!(1.0))).unwrap();
    // ... and a sell at 0 is a market sell.
    let spec = OrderSpec::from_wire(Side::Sell, 0.0, 1.0).unwrap();
    let report = book.submit(spec).unwrap();
    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].price, dec!(99.00));
}

#[test]
fn snapshot_wire_shape() {
    let book = book();
    book.submit(limit(Side::Buy, dec!(20000.00), dec!(1.5))).unwrap();
    book.submit(limit(Side::Buy, dec!(20000.00), dec!(0.5))).unwrap();
    book.submit(limit(Side::Sell, dec!(20100.00), dec!(2.0))).unwrap();

    let json = serde_json::to_value(book.snapshot(Some(10)).unwrap()).unwrap();
    assert_eq!(json["symbol"], "BTC/USD");
    assert_eq!(json["bids"][0]["price"], serde_json::json!(20000.0));
    assert_eq!(json["bids"][0]["quantity"], serde_json::json!(2.0));
    assert_eq!(json["bids"][0]["order_count"], serde_json::json!(2));
    assert_eq!(json["asks"][0]["price"], serde_json::json!(20100.0));
    assert!(json["timestamp"].is_f64());
}

//--------------------------------------------------------------------------------------------------
// Registry end-to-end
//--------------------------------------------------------------------------------------------------

#[test]
fn registry_isolates_markets() {
    let registry = MarketRegistry::new();
    registry.create(BookConfig::new("BTC/USD")).unwrap();
    registry.create(BookConfig::new("ETH/USD")).unwrap();

    registry
        .place("BTC/USD", limit(Side::Sell, dec!(20000.00), dec!(1.0)).with_order_id("btc-ask"))
        .unwrap();
    // A crossing buy on ETH/USD must not touch the BTC book.
    let report = registry
        .place("ETH/USD", limit(Side::Buy, dec!(20000.00), dec!(1.0)).with_order_id("eth-bid"))
        .unwrap();
    assert!(report.trades.is_empty());
    assert!(report.resting);

    assert_eq!(registry.get("BTC/USD").unwrap().best_ask(), Some(dec!(20000.00)));
    assert_eq!(registry.get("ETH/USD").unwrap().best_bid(), Some(dec!(20000.00)));
}

#[test]
fn registry_user_orders_across_markets() {
    let registry = MarketRegistry::new();
    registry.create(BookConfig::new("BTC/USD")).unwrap();
    registry.create(BookConfig::new("ETH/USD")).unwrap();

    registry
        .place(
            "BTC/USD",
            limit(Side::Buy, dec!(100.00), dec!(1.0)).with_order_id("o1").with_user("alice"),
        )
        .unwrap();
    registry
        .place(
            "ETH/USD",
            limit(Side::Sell, dec!(2000.00), dec!(1.0)).with_order_id("o2").with_user("alice"),
        )
        .unwrap();

    let orders = registry.user_orders("alice");
    let ids: Vec<&str> = orders.iter().map(|o| o.order_id.as_str()).collect();
    assert_eq!(ids, vec!["o1", "o2"]);

    registry.cancel("o1").unwrap();
    assert_eq!(registry.user_orders("alice").len(), 1);
}

#[test]
fn registry_aggregates_stats() {
    let registry = MarketRegistry::new();
    registry.create(BookConfig::new("BTC/USD")).unwrap();
    registry.create(BookConfig::new("ETH/USD")).unwrap();
    registry.place("BTC/USD", limit(Side::Buy, dec!(100.00), dec!(1.0))).unwrap();

    let stats = registry.stats();
    assert_eq!(stats.total_markets, 2);
    assert_eq!(stats.total_open_orders, 1);
    assert_eq!(stats.markets["ETH/USD"].open_orders, 0);
}
