//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Per-book configuration. A BookConfig is plain serde-loadable data handed to
// OrderBook::new (or MarketRegistry::create); nothing here reads process-wide
// state.
//--------------------------------------------------------------------------------------------------

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which reference price arms parked stop orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Trigger off the last trade price. The default.
    LastTrade,
    /// Trigger off the opposing best quote: best ask for buy stops, best bid
    /// for sell stops.
    BestQuote,
}

impl Default for TriggerSource {
    fn default() -> Self {
        Self::LastTrade
    }
}

/// Configuration for a single order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BookConfig {
    /// Trading pair symbol, e.g. `BTC/USD`.
    pub symbol: String,
    /// Decimal places allowed on prices.
    pub price_precision: u32,
    /// Decimal places allowed on quantities.
    pub quantity_precision: u32,
    /// Fee rate applied to makers, e.g. `0.001` for 0.1%.
    pub maker_fee_rate: Decimal,
    /// Fee rate applied to takers.
    pub taker_fee_rate: Decimal,
    /// Retained toggle: fills always execute at the maker's resting price, so
    /// this currently affects nothing. Kept for order types that may price
    /// differently.
    pub enable_price_improvement: bool,
    /// How often the background sweeper looks for expired orders.
    pub check_expiry_interval: Duration,
    /// Maximum number of trades retained in the history ring.
    pub max_trade_history: usize,
    /// Maximum number of events retained by the event bus.
    pub max_event_history: usize,
    /// How many top levels per side the DEPTH_CHANGED watermark covers.
    pub depth_event_levels: usize,
    /// Reference price used to arm parked stops.
    pub trigger_source: TriggerSource,
    /// Session close used as the expiry of Day orders. Day submissions are
    /// rejected while unset.
    pub session_close: Option<DateTime<Utc>>,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            price_precision: 2,
            quantity_precision: 8,
            maker_fee_rate: Decimal::ZERO,
            taker_fee_rate: Decimal::ZERO,
            enable_price_improvement: false,
            check_expiry_interval: Duration::from_secs(1),
            max_trade_history: 10_000,
            max_event_history: 1000,
            depth_event_levels: 10,
            trigger_source: TriggerSource::default(),
            session_close: None,
        }
    }
}

impl BookConfig {
    /// A default configuration for `symbol`.
    pub fn new(symbol: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), ..Self::default() }
    }

    /// Sets maker and taker fee rates.
    pub fn with_fees(mut self, maker_fee_rate: Decimal, taker_fee_rate: Decimal) -> Self {
        self.maker_fee_rate = maker_fee_rate;
        self.taker_fee_rate = taker_fee_rate;
        self
    }

    /// Sets price and quantity precisions.
    pub fn with_precisions(mut self, price_precision: u32, quantity_precision: u32) -> Self {
        self.price_precision = price_precision;
        self.quantity_precision = quantity_precision;
        self
    }

    /// Sets the session close used by Day orders.
    pub fn with_session_close(mut self, session_close: DateTime<Utc>) -> Self {
        self.session_close = Some(session_close);
        self
    }

    /// Sets the stop trigger reference price source.
    pub fn with_trigger_source(mut self, trigger_source: TriggerSource) -> Self {
        self.trigger_source = trigger_source;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let config = BookConfig::new("BTC/USD");
        assert_eq!(config.symbol, "BTC/USD");
        assert_eq!(config.price_precision, 2);
        assert_eq!(config.quantity_precision, 8);
        assert_eq!(config.max_trade_history, 10_000);
        assert_eq!(config.max_event_history, 1000);
        assert_eq!(config.check_expiry_interval, Duration::from_secs(1));
        assert_eq!(config.trigger_source, TriggerSource::LastTrade);
        assert!(config.session_close.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let close = Utc::now() + chrono::Duration::hours(8);
        let config = BookConfig::new("ETH/USD")
            .with_fees(dec!(0.001), dec!(0.002))
            .with_precisions(4, 6)
            .with_session_close(close)
            .with_trigger_source(TriggerSource::BestQuote);
        assert_eq!(config.maker_fee_rate, dec!(0.001));
        assert_eq!(config.taker_fee_rate, dec!(0.002));
        assert_eq!(config.price_precision, 4);
        assert_eq!(config.session_close, Some(close));
        assert_eq!(config.trigger_source, TriggerSource::BestQuote);
    }

    #[test]
    fn test_loadable_from_json() {
        let config: BookConfig = serde_json::from_str(
            r#"{"symbol": "BTC/USD", "price_precision": 2, "maker_fee_rate": "0.001"}"#,
        )
        .unwrap();
        assert_eq!(config.symbol, "BTC/USD");
        assert_eq!(config.maker_fee_rate, dec!(0.001));
        // Unspecified fields fall back to defaults.
        assert_eq!(config.quantity_precision, 8);
    }
}
