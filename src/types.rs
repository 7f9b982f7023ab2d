//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module defines the core data types used throughout the order book engine,
// including orders, trades, and the various side/type/time-in-force enums.
//
// | Section            | Description                                                      |
// |--------------------|------------------------------------------------------------------|
// | ENUMS              | Discrete sets of values (Side, OrderType, TimeInForce...).       |
// | STRUCTS            | Orders, order submissions and trades.                            |
// | ERRORS             | Errors returned by book operations.                              |
// | TESTS              | Unit tests for the defined types.                                |
//--------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use num_traits::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
//  ENUMS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                  |
// |---------------|----------------------------------------------|
// | Side          | Side of an order (Buy/Sell).                 |
// | OrderType     | Matching behaviour of an order.              |
// | TimeInForce   | How long an unfilled remainder persists.     |
// | CancelReason  | Why an order left the book without filling.  |
//--------------------------------------------------------------------------------------------------

/// Represents the side of an order (Buy or Sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// A buy order (resting on the bid side).
    Buy,
    /// A sell order (resting on the ask side).
    Sell,
}

impl Side {
    /// Returns the opposing side, i.e. the side an incoming order matches against.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Represents the type of an order, influencing its matching behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// An order that executes at a specific price or better.
    Limit,
    /// An order that executes immediately at the best available prices.
    Market,
    /// A conditional order that becomes a Limit order when the trigger price is reached.
    StopLimit,
    /// A conditional order that becomes a Market order when the trigger price is reached.
    StopMarket,
    /// A limit order that only exposes `displayed_quantity` to depth snapshots.
    Iceberg,
}

impl Default for OrderType {
    fn default() -> Self {
        Self::Limit
    }
}

/// Defines how long an unfilled remainder stays alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good Till Cancel - remains active until explicitly cancelled.
    Gtc,
    /// Immediate Or Cancel - fill what is immediately possible, discard the rest.
    Ioc,
    /// Fill Or Kill - fill completely and immediately, or reject with no state change.
    Fok,
    /// Good Till Date - remains active until `expiry_time`.
    Gtd,
    /// Good for the trading day - expires at the configured session close.
    Day,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::Gtc
    }
}

/// Why an order was removed from the book without being fully filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelReason {
    /// Cancelled on explicit client request.
    User,
    /// The unfilled remainder of an IOC order was discarded.
    IocRemainder,
    /// The order reached its expiry deadline.
    Expired,
}

//--------------------------------------------------------------------------------------------------
//  STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                    |
// |---------------|------------------------------------------------|
// | OrderSpec     | Client-supplied order submission.              |
// | Order         | A live order owned by its book.                |
// | OrderPatch    | Requested changes for `modify`.                |
// | Trade         | A completed maker/taker fill with fees.        |
//--------------------------------------------------------------------------------------------------

/// A client-supplied order submission. Everything the caller may set lives here;
/// the book turns an accepted spec into an [`Order`] it then owns exclusively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Client-chosen order id. Generated when absent; must be unique within the book.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Side of the order.
    pub side: Side,
    /// Matching behaviour. Defaults to Limit.
    #[serde(default)]
    pub order_type: OrderType,
    /// Limit price. Absent for pure Market orders.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// Trigger price. Required for the stop variants.
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    /// Order quantity in base units.
    pub quantity: Decimal,
    /// Iceberg peak: the largest slice exposed to depth snapshots.
    #[serde(default)]
    pub displayed_quantity: Option<Decimal>,
    /// Time in force policy. Defaults to GTC.
    #[serde(default)]
    pub time_in_force: TimeInForce,
    /// Expiry deadline. Required for GTD; derived from the session close for Day.
    #[serde(default)]
    pub expiry_time: Option<DateTime<Utc>>,
    /// Reject instead of trading if the order would cross on arrival.
    #[serde(default)]
    pub post_only: bool,
    /// Opaque user identifier, carried into trades for fee attribution.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Trail distance for trailing-stop support. Carried but not matched today.
    #[serde(default)]
    pub trail_value: Option<Decimal>,
    /// Whether `trail_value` is a percentage rather than an absolute offset.
    #[serde(default)]
    pub trail_is_percent: bool,
}

impl OrderSpec {
    /// Creates a GTC limit order spec.
    pub fn limit(side: Side, price: Decimal, quantity: Decimal) -> Self {
        Self {
            order_id: None,
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            stop_price: None,
            quantity,
            displayed_quantity: None,
            time_in_force: TimeInForce::Gtc,
            expiry_time: None,
            post_only: false,
            user_id: None,
            trail_value: None,
            trail_is_percent: false,
        }
    }

    /// Creates a market order spec.
    pub fn market(side: Side, quantity: Decimal) -> Self {
        Self {
            order_type: OrderType::Market,
            price: None,
            ..Self::limit(side, Decimal::ZERO, quantity)
        }
    }

    /// Creates a stop-limit order spec: rests as a limit at `price` once `stop_price` triggers.
    pub fn stop_limit(side: Side, stop_price: Decimal, price: Decimal, quantity: Decimal) -> Self {
        Self {
            order_type: OrderType::StopLimit,
            stop_price: Some(stop_price),
            ..Self::limit(side, price, quantity)
        }
    }

    /// Creates a stop-market order spec: becomes a market order once `stop_price` triggers.
    pub fn stop_market(side: Side, stop_price: Decimal, quantity: Decimal) -> Self {
        Self {
            order_type: OrderType::StopMarket,
            price: None,
            stop_price: Some(stop_price),
            ..Self::limit(side, Decimal::ZERO, quantity)
        }
    }

    /// Creates an iceberg order spec exposing at most `displayed` per refill.
    pub fn iceberg(side: Side, price: Decimal, quantity: Decimal, displayed: Decimal) -> Self {
        Self {
            order_type: OrderType::Iceberg,
            displayed_quantity: Some(displayed),
            ..Self::limit(side, price, quantity)
        }
    }

    /// Builds a spec from the legacy wire convention used by chart/visualizer
    /// clients: a buy priced at `+inf` and a sell priced at `0` are market
    /// orders, everything else is a limit order at the given price.
    pub fn from_wire(side: Side, price: f64, quantity: f64) -> Result<Self, OrderBookError> {
        let quantity = Decimal::from_f64(quantity)
            .ok_or(OrderBookError::InvalidQuantity { quantity: Decimal::ZERO })?;

        let is_market = match side {
            Side::Buy => price.is_infinite() && price.is_sign_positive(),
            Side::Sell => price == 0.0,
        };
        if is_market {
            return Ok(Self::market(side, quantity));
        }

        let price = Decimal::from_f64(price).ok_or(OrderBookError::InvalidPrice {
            price: Decimal::ZERO,
        })?;
        Ok(Self::limit(side, price, quantity))
    }

    /// Sets the order id.
    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// Sets the user id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the time in force. GTD additionally needs [`Self::with_expiry`].
    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }

    /// Sets the expiry deadline.
    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry_time = Some(expiry);
        self
    }

    /// Marks the order post-only.
    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }
}

/// A live order. Plain data: once accepted the book owns it exclusively and
/// consumers only ever receive clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Unique identifier within the owning book.
    pub order_id: String,
    /// Side of the order.
    pub side: Side,
    /// Matching behaviour.
    pub order_type: OrderType,
    /// Limit price. Absent for pure Market orders.
    pub price: Option<Decimal>,
    /// Trigger price for the stop variants.
    pub stop_price: Option<Decimal>,
    /// Remaining quantity available to trade.
    pub quantity: Decimal,
    /// Quantity at submission. Immutable.
    pub original_quantity: Decimal,
    /// Iceberg peak. The visible slice is `min(peak, quantity)`.
    pub displayed_quantity: Option<Decimal>,
    /// Time in force policy.
    pub time_in_force: TimeInForce,
    /// Expiry deadline, when one applies.
    pub expiry_time: Option<DateTime<Utc>>,
    /// Reject instead of trading when crossing on arrival.
    pub post_only: bool,
    /// Opaque user identifier.
    pub user_id: Option<String>,
    /// Wall-clock submission time.
    pub submitted_at: DateTime<Utc>,
    /// Book-assigned sequence number. Defines time priority.
    pub sequence: u64,
    /// Trail distance for trailing-stop support. Not matched today.
    pub trail_value: Option<Decimal>,
    /// Whether `trail_value` is a percentage.
    pub trail_is_percent: bool,
}

impl Order {
    /// The quantity exposed to displayed-depth aggregation. For icebergs this
    /// refills to `min(peak, remaining)` after every fill without moving the
    /// order, so a refilled slice keeps its time priority.
    pub fn visible_quantity(&self) -> Decimal {
        match self.displayed_quantity {
            Some(peak) => peak.min(self.quantity),
            None => self.quantity,
        }
    }

    /// Whether this order is parked until a trigger price is reached.
    pub fn is_stop(&self) -> bool {
        matches!(self.order_type, OrderType::StopLimit | OrderType::StopMarket)
    }

    /// Whether the order's deadline has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time.is_some_and(|deadline| now >= deadline)
    }
}

/// Requested changes for [`crate::OrderBook::modify`]. All changes apply
/// atomically or not at all. An empty patch is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderPatch {
    /// New limit price. Changing price loses time priority.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// New remaining quantity. Zero cancels; an increase loses time priority.
    #[serde(default)]
    pub quantity: Option<Decimal>,
    /// New expiry deadline. An expiry-only change keeps time priority.
    #[serde(default)]
    pub expiry_time: Option<DateTime<Utc>>,
}

impl OrderPatch {
    /// A patch changing only the price.
    pub fn price(price: Decimal) -> Self {
        Self { price: Some(price), ..Self::default() }
    }

    /// A patch changing only the quantity.
    pub fn quantity(quantity: Decimal) -> Self {
        Self { quantity: Some(quantity), ..Self::default() }
    }

    /// A patch changing only the expiry deadline.
    pub fn expiry(expiry: DateTime<Utc>) -> Self {
        Self { expiry_time: Some(expiry), ..Self::default() }
    }

    /// True when no change is requested.
    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.quantity.is_none() && self.expiry_time.is_none()
    }
}

/// A completed trade between a resting maker and an incoming taker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Unique identifier for the trade.
    pub trade_id: String,
    /// Id of the resting order (maker).
    pub maker_order_id: String,
    /// Id of the incoming order that crossed it (taker).
    pub taker_order_id: String,
    /// Execution price. Always the maker's resting price.
    pub price: Decimal,
    /// Quantity traded in base units.
    pub quantity: Decimal,
    /// When the trade occurred.
    pub executed_at: DateTime<Utc>,
    /// Fee charged to the maker.
    pub maker_fee: Decimal,
    /// Fee charged to the taker.
    pub taker_fee: Decimal,
    /// Fee rate applied to the maker.
    pub maker_fee_rate: Decimal,
    /// Fee rate applied to the taker.
    pub taker_fee_rate: Decimal,
    /// User behind the maker order, when known.
    pub maker_user_id: Option<String>,
    /// User behind the taker order, when known.
    pub taker_user_id: Option<String>,
}

impl Trade {
    /// Creates a trade, deriving fees as `quantity * price * rate` in decimal
    /// arithmetic. Use [`Self::with_explicit_fees`] to override the derivation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        maker_order_id: impl Into<String>,
        taker_order_id: impl Into<String>,
        price: Decimal,
        quantity: Decimal,
        maker_fee_rate: Decimal,
        taker_fee_rate: Decimal,
        maker_user_id: Option<String>,
        taker_user_id: Option<String>,
    ) -> Self {
        let value = price * quantity;
        Self {
            trade_id: Uuid::new_v4().to_string(),
            maker_order_id: maker_order_id.into(),
            taker_order_id: taker_order_id.into(),
            price,
            quantity,
            executed_at: Utc::now(),
            maker_fee: value * maker_fee_rate,
            taker_fee: value * taker_fee_rate,
            maker_fee_rate,
            taker_fee_rate,
            maker_user_id,
            taker_user_id,
        }
    }

    /// Overrides the derived fees with explicitly supplied amounts.
    pub fn with_explicit_fees(mut self, maker_fee: Decimal, taker_fee: Decimal) -> Self {
        self.maker_fee = maker_fee;
        self.taker_fee = taker_fee;
        self
    }

    /// Quote value of the trade (`price * quantity`).
    pub fn value(&self) -> Decimal {
        self.price * self.quantity
    }
}

//--------------------------------------------------------------------------------------------------
//  ERRORS
//--------------------------------------------------------------------------------------------------

/// Errors returned by book operations. All validation happens before any
/// mutation, so an error implies the book is unchanged — except [`Self::Poisoned`],
/// which reports a book that refuses further operations after an internal
/// invariant violation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderBookError {
    /// A price or quantity carries more decimal places than the symbol allows.
    #[error("{field} {value} exceeds the configured precision of {precision} decimal places")]
    InvalidPrecision {
        /// Which field violated the precision ("price", "quantity", ...).
        field: &'static str,
        /// The offending value.
        value: Decimal,
        /// The configured number of decimal places.
        precision: u32,
    },

    /// The quantity is non-positive or an iceberg display slice is invalid.
    #[error("invalid quantity: {quantity}")]
    InvalidQuantity {
        /// The offending quantity.
        quantity: Decimal,
    },

    /// The price is non-positive for an order type that requires one.
    #[error("invalid price: {price}")]
    InvalidPrice {
        /// The offending price.
        price: Decimal,
    },

    /// The supplied order id already exists in this book.
    #[error("duplicate order id: {0}")]
    DuplicateOrderId(String),

    /// The order type and supplied fields do not form a valid combination.
    #[error("malformed order type: {0}")]
    UnknownOrderType(String),

    /// A FOK order could not be filled completely. No state changed.
    #[error("fill-or-kill order unfillable: {available} available of {required} required")]
    FokUnfillable {
        /// Quantity fillable at crossing prices.
        available: Decimal,
        /// Quantity the order required.
        required: Decimal,
    },

    /// A post-only order would have crossed on arrival. No state changed.
    #[error("post-only order would cross at {price}")]
    PostOnlyWouldCross {
        /// The opposing best price it would have crossed.
        price: Decimal,
    },

    /// A GTD order's expiry deadline is not strictly in the future.
    #[error("GTD expiry {0} is not in the future")]
    GtdExpiryInPast(DateTime<Utc>),

    /// A Day order was submitted but no session close is configured.
    #[error("day order submitted without a configured session close")]
    SessionCloseUnset,

    /// The referenced order does not exist in this book.
    #[error("order not found: {0}")]
    NotFound(String),

    /// The modification request is empty or inconsistent.
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// An internal invariant was violated; the book refuses further operations.
    #[error("order book is poisoned and requires external recovery")]
    Poisoned,
}

/// Type alias for Result with OrderBookError.
pub type BookResult<T> = Result<T, OrderBookError>;

//--------------------------------------------------------------------------------------------------
//  TESTS
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_spec_builders() {
        let spec = OrderSpec::limit(Side::Buy, dec!(100.00), dec!(1.5))
            .with_order_id("bid-1")
            .with_user("alice")
            .with_time_in_force(TimeInForce::Ioc);
        assert_eq!(spec.order_type, OrderType::Limit);
        assert_eq!(spec.price, Some(dec!(100.00)));
        assert_eq!(spec.order_id.as_deref(), Some("bid-1"));
        assert_eq!(spec.time_in_force, TimeInForce::Ioc);

        let market = OrderSpec::market(Side::Sell, dec!(2));
        assert_eq!(market.order_type, OrderType::Market);
        assert!(market.price.is_none());

        let stop = OrderSpec::stop_limit(Side::Sell, dec!(95), dec!(94.5), dec!(1));
        assert_eq!(stop.stop_price, Some(dec!(95)));
        assert_eq!(stop.price, Some(dec!(94.5)));

        let iceberg = OrderSpec::iceberg(Side::Buy, dec!(99), dec!(10), dec!(2));
        assert_eq!(iceberg.displayed_quantity, Some(dec!(2)));
    }

    #[test]
    fn test_wire_sentinel_prices() {
        let market_buy = OrderSpec::from_wire(Side::Buy, f64::INFINITY, 1.0).unwrap();
        assert_eq!(market_buy.order_type, OrderType::Market);
        assert!(market_buy.price.is_none());

        let market_sell = OrderSpec::from_wire(Side::Sell, 0.0, 2.0).unwrap();
        assert_eq!(market_sell.order_type, OrderType::Market);

        let limit = OrderSpec::from_wire(Side::Buy, 20000.0, 1.5).unwrap();
        assert_eq!(limit.order_type, OrderType::Limit);
        assert_eq!(limit.price, Some(dec!(20000)));
        assert_eq!(limit.quantity, dec!(1.5));
    }

    #[test]
    fn test_visible_quantity_refills_in_place() {
        let mut order = Order {
            order_id: "ice-1".to_string(),
            side: Side::Sell,
            order_type: OrderType::Iceberg,
            price: Some(dec!(101.00)),
            stop_price: None,
            quantity: dec!(10),
            original_quantity: dec!(10),
            displayed_quantity: Some(dec!(3)),
            time_in_force: TimeInForce::Gtc,
            expiry_time: None,
            post_only: false,
            user_id: None,
            submitted_at: Utc::now(),
            sequence: 1,
            trail_value: None,
            trail_is_percent: false,
        };
        assert_eq!(order.visible_quantity(), dec!(3));

        // Draining below the peak pins the visible slice to the remainder.
        order.quantity = dec!(2);
        assert_eq!(order.visible_quantity(), dec!(2));
    }

    #[test]
    fn test_trade_fee_derivation() {
        let trade = Trade::new(
            "maker-1",
            "taker-1",
            dec!(20000.00),
            dec!(0.5),
            dec!(0.001),
            dec!(0.002),
            Some("alice".to_string()),
            Some("bob".to_string()),
        );
        assert_eq!(trade.value(), dec!(10000.000));
        assert_eq!(trade.maker_fee, dec!(10.0000000));
        assert_eq!(trade.taker_fee, dec!(20.0000000));

        let overridden = trade.clone().with_explicit_fees(dec!(1), dec!(2));
        assert_eq!(overridden.maker_fee, dec!(1));
        assert_eq!(overridden.taker_fee, dec!(2));
    }

    #[test]
    fn test_patch_helpers() {
        assert!(OrderPatch::default().is_empty());
        assert!(!OrderPatch::price(dec!(10)).is_empty());
        assert!(!OrderPatch::quantity(dec!(1)).is_empty());
    }

    #[test]
    fn test_error_messages() {
        let err = OrderBookError::InvalidPrecision {
            field: "price",
            value: dec!(1.234),
            precision: 2,
        };
        assert_eq!(
            err.to_string(),
            "price 1.234 exceeds the configured precision of 2 decimal places"
        );
        assert_eq!(
            OrderBookError::NotFound("abc".to_string()).to_string(),
            "order not found: abc"
        );
    }
}
