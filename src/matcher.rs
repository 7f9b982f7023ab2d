//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the matching pass: draining an opposing side book
// against an incoming order under price-time priority. It only mutates the
// taker and the opposing side it is given; time-in-force handling, event
// emission and stop triggering stay with the owning book so the pass itself
// is a pure function over its inputs.
//
// | Name               | Description                                       | Return Type   |
// |--------------------|---------------------------------------------------|---------------|
// | match_against      | Drain crossing levels, fill at maker prices       | MatchOutcome  |
// | fillable_quantity  | Read-only probe of fillable quantity (FOK)        | Decimal       |
// | would_cross        | Whether any fill would occur on arrival           | Option<Decimal> |
//--------------------------------------------------------------------------------------------------

use rust_decimal::Decimal;
use tracing::trace;

use crate::book::{DepthView, SideBook};
use crate::types::{Order, Side};

/// One fill produced by a matching pass.
#[derive(Debug, Clone)]
pub struct Fill {
    /// Post-fill snapshot of the maker order. `quantity` is the maker's
    /// remainder after this fill; zero means it left the book.
    pub maker: Order,
    /// Execution price: always the maker's resting price.
    pub price: Decimal,
    /// Quantity exchanged.
    pub quantity: Decimal,
}

/// Everything a matching pass did to the opposing side.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    /// Fills in execution order.
    pub fills: Vec<Fill>,
    /// Prices of levels that were fully drained and removed.
    pub removed_levels: Vec<Decimal>,
    /// Prices of levels that were partially drained and still rest.
    pub touched_levels: Vec<Decimal>,
}

impl MatchOutcome {
    /// Total quantity filled across the pass.
    pub fn filled_quantity(&self) -> Decimal {
        self.fills.iter().map(|fill| fill.quantity).sum()
    }
}

/// Whether `taker` crosses a resting level at `level_price`. Market orders
/// (no limit price) cross everything.
fn crosses(taker: &Order, level_price: Decimal) -> bool {
    match taker.price {
        None => true,
        Some(limit) => match taker.side {
            Side::Buy => level_price <= limit,
            Side::Sell => level_price >= limit,
        },
    }
}

/// Drains the opposing side against `taker` until its quantity is exhausted
/// or the best level no longer crosses.
///
/// Levels drain head-first (oldest order fills first) and every fill executes
/// at the maker's resting price, which is what yields price improvement for
/// the taker. Fully filled makers and emptied levels are removed in the same
/// pass.
pub fn match_against(taker: &mut Order, opposing: &mut SideBook) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();

    while !taker.quantity.is_zero() {
        let level_price = match opposing.best_price() {
            Some(price) => price,
            None => break,
        };
        if !crosses(taker, level_price) {
            break;
        }

        let emptied = {
            let level = match opposing.level_mut(level_price) {
                Some(level) => level,
                None => break,
            };
            while !taker.quantity.is_zero() {
                let (maker, fill_quantity) = match level.fill_front(taker.quantity) {
                    Some(filled) => filled,
                    None => break,
                };
                taker.quantity -= fill_quantity;
                trace!(
                    maker = %maker.order_id,
                    taker = %taker.order_id,
                    price = %level_price,
                    quantity = %fill_quantity,
                    "matched"
                );
                outcome.fills.push(Fill { maker, price: level_price, quantity: fill_quantity });
            }
            level.is_empty()
        };

        if emptied {
            opposing.remove_level_if_empty(level_price);
            outcome.removed_levels.push(level_price);
        } else {
            outcome.touched_levels.push(level_price);
        }
    }

    outcome
}

/// Read-only probe: the quantity `taker` could fill right now at crossing
/// prices, capped at the taker's own quantity. Used for the two-phase FOK
/// check and the post-only rejection, so a rejection leaves no state change.
pub fn fillable_quantity(taker: &Order, opposing: &SideBook) -> Decimal {
    let mut available = Decimal::ZERO;
    for level in opposing.iter_from_best() {
        if !crosses(taker, level.price) || available >= taker.quantity {
            break;
        }
        available += level.aggregate(DepthView::Full);
    }
    available.min(taker.quantity)
}

/// The opposing best price `taker` would cross on arrival, or `None` when it
/// would rest untouched.
pub fn would_cross(taker: &Order, opposing: &SideBook) -> Option<Decimal> {
    let best = opposing.best_price()?;
    crosses(taker, best).then_some(best)
}
