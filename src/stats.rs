//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the book's monitoring state: operation counters and
// bounded latency reservoirs with percentile summaries.
//
// | Name              | Description                                       |
// |-------------------|---------------------------------------------------|
// | OperationCounters | Monotonic counters for book operations            |
// | LatencySummary    | Percentile summary of one operation's latencies   |
// | LatencyMeter      | Per-operation bounded reservoirs                  |
// | BookStatistics    | The full statistics report returned to callers    |
//--------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;

/// Maximum number of latency samples retained per operation.
const MAX_SAMPLES: usize = 1000;

/// Monotonic counters over the book's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationCounters {
    /// Orders accepted onto the book (resting or parked).
    pub orders_added: u64,
    /// Successful modifications.
    pub orders_modified: u64,
    /// Orders cancelled (client request or IOC remainder).
    pub orders_cancelled: u64,
    /// Orders removed by the expiry sweeper.
    pub orders_expired: u64,
    /// Submissions rejected without state change.
    pub orders_rejected: u64,
    /// Trades executed.
    pub trades_executed: u64,
    /// Total base quantity traded.
    pub volume_traded: Decimal,
}

/// Percentile summary of one operation's recorded latencies, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Number of samples in the reservoir.
    pub count: usize,
    /// Fastest sample.
    pub min: f64,
    /// Slowest sample.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Median.
    pub p50: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 99th percentile.
    pub p99: f64,
}

#[derive(Debug, Clone, Default)]
struct Reservoir {
    samples: Vec<f64>,
}

impl Reservoir {
    fn record(&mut self, latency: Duration) {
        if self.samples.len() == MAX_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push(latency.as_secs_f64());
    }

    fn summary(&self) -> Option<LatencySummary> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let count = sorted.len();
        let at = |quantile: f64| sorted[((count as f64 * quantile) as usize).min(count - 1)];
        Some(LatencySummary {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sorted.iter().sum::<f64>() / count as f64,
            p50: at(0.50),
            p90: at(0.90),
            p99: at(0.99),
        })
    }
}

/// Fixed-size latency reservoirs keyed by operation name. Oldest samples are
/// evicted once an operation exceeds its reservoir capacity.
#[derive(Debug, Clone, Default)]
pub struct LatencyMeter {
    reservoirs: HashMap<&'static str, Reservoir>,
}

impl LatencyMeter {
    /// Records one sample for `operation`.
    pub fn record(&mut self, operation: &'static str, latency: Duration) {
        self.reservoirs.entry(operation).or_default().record(latency);
    }

    /// Summaries for every operation with at least one sample.
    pub fn summaries(&self) -> BTreeMap<String, LatencySummary> {
        self.reservoirs
            .iter()
            .filter_map(|(op, reservoir)| reservoir.summary().map(|s| (op.to_string(), s)))
            .collect()
    }
}

/// Point-in-time statistics report for one book.
#[derive(Debug, Clone, Serialize)]
pub struct BookStatistics {
    /// Symbol of the reporting book.
    pub symbol: String,
    /// Lifetime operation counters.
    pub counters: OperationCounters,
    /// Number of bid price levels.
    pub bid_levels: usize,
    /// Number of ask price levels.
    pub ask_levels: usize,
    /// Resting orders across both sides (parked stops excluded).
    pub open_orders: usize,
    /// Stop orders parked awaiting their trigger.
    pub parked_stops: usize,
    /// Best (highest) bid price.
    pub best_bid: Option<Decimal>,
    /// Best (lowest) ask price.
    pub best_ask: Option<Decimal>,
    /// Best ask minus best bid.
    pub spread: Option<Decimal>,
    /// Midpoint of best bid and ask.
    pub mid_price: Option<Decimal>,
    /// Trades currently retained in the history ring.
    pub trade_history_size: usize,
    /// Latency summaries per operation, in seconds.
    pub latencies: BTreeMap<String, LatencySummary>,
}
