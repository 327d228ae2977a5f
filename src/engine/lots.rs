//! Tax-lot allocation engine.
//!
//! Pure functions over `PositionState`: no I/O, no clock, no locking.
//! The dispatcher guarantees single-threaded access per position, so these
//! run on plain `&mut` state.
//!
//! Sign convention: `remaining_qty` is positive for LONG lots and negative
//! for SHORT lots. Reduction requests are magnitudes; the position's
//! direction decides which way the remaining quantity moves.

use crate::engine::state::{PositionState, SchedulePoint};
use crate::models::{Direction, TaxLotMethod};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A quantum of a position created by an acquiring trade.
///
/// Lots are immutable in principle: a reduction replaces the lot with a
/// copy carrying a smaller `remaining_qty`; a market reset replaces it with
/// a copy carrying a new `current_ref_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLot {
    pub id: Uuid,
    pub trade_date: NaiveDate,
    pub settlement_date: Option<NaiveDate>,
    pub original_qty: Decimal,
    pub remaining_qty: Decimal,
    /// Price at creation; never changes afterwards.
    pub cost_basis: Decimal,
    /// Updated by market reset events only.
    pub current_ref_price: Decimal,
    pub settled_quantity: Option<Decimal>,
}

impl TaxLot {
    pub fn is_closed(&self) -> bool {
        self.remaining_qty.is_zero()
    }

    /// Unsigned quantity still open on this lot.
    pub fn open_magnitude(&self) -> Decimal {
        self.remaining_qty.abs()
    }

    /// Copy with a new reference price (RESET events).
    pub fn with_ref_price(&self, new_price: Decimal) -> Self {
        Self {
            current_ref_price: new_price,
            ..self.clone()
        }
    }
}

/// One lot's share of an allocation, kept on the event for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotAllocationEntry {
    pub lot_id: Uuid,
    /// Unsigned quantity taken from (or added to) the lot.
    pub quantity: Decimal,
    pub price: Decimal,
    pub realized_pnl: Decimal,
}

/// Outcome of an add or reduce pass over the open lots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotAllocation {
    pub entries: Vec<LotAllocationEntry>,
    /// False when the requested reduction exceeded the open quantity.
    /// Policy: allocate what is available, never over-close.
    pub fully_allocated: bool,
    pub realized_pnl: Decimal,
}

impl LotAllocation {
    fn single(lot_id: Uuid, quantity: Decimal, price: Decimal) -> Self {
        Self {
            entries: vec![LotAllocationEntry {
                lot_id,
                quantity,
                price,
                realized_pnl: Decimal::ZERO,
            }],
            fully_allocated: true,
            realized_pnl: Decimal::ZERO,
        }
    }
}

/// Append a new lot created by an acquiring trade.
///
/// `signed_qty` already carries the direction's sign. The
/// price/quantity schedule gets an entry for the trade date; an existing
/// entry for the same date is replaced and the schedule stays date-sorted.
pub fn add_lot(
    state: &mut PositionState,
    signed_qty: Decimal,
    price: Decimal,
    trade_date: NaiveDate,
    settlement_date: Option<NaiveDate>,
) -> LotAllocation {
    let lot = TaxLot {
        id: Uuid::new_v4(),
        trade_date,
        settlement_date,
        original_qty: signed_qty,
        remaining_qty: signed_qty,
        cost_basis: price,
        current_ref_price: price,
        settled_quantity: None,
    };
    let allocation = LotAllocation::single(lot.id, signed_qty.abs(), price);
    state.open_lots.push(lot);
    upsert_schedule_point(
        &mut state.price_quantity_schedule,
        SchedulePoint {
            date: trade_date,
            quantity: signed_qty,
            price,
        },
    );
    allocation
}

/// Consume open lots by the contract's method.
///
/// `qty_to_reduce` is an unsigned magnitude. Lots are visited in method
/// order, each contributing `min(request, lot.open_magnitude())`. Exhausted
/// lots are dropped from the open list; the insertion order of survivors is
/// preserved. Realized PnL accumulates onto the state.
pub fn reduce_lots(
    state: &mut PositionState,
    qty_to_reduce: Decimal,
    method: TaxLotMethod,
    close_price: Decimal,
) -> LotAllocation {
    let direction = state.direction;
    let mut remaining_request = qty_to_reduce.abs();
    let mut entries = Vec::new();

    for idx in consumption_order(&state.open_lots, method) {
        if remaining_request.is_zero() {
            break;
        }
        let lot = &mut state.open_lots[idx];
        let take = remaining_request.min(lot.open_magnitude());
        if take.is_zero() {
            continue;
        }
        let pnl = realized_pnl(direction, lot.cost_basis, close_price, take);
        entries.push(LotAllocationEntry {
            lot_id: lot.id,
            quantity: take,
            price: close_price,
            realized_pnl: pnl,
        });
        // Move remaining toward zero along the direction's sign.
        lot.remaining_qty -= direction.sign() * take;
        remaining_request -= take;
    }

    state.open_lots.retain(|lot| !lot.is_closed());

    let realized: Decimal = entries.iter().map(|e| e.realized_pnl).sum();
    state.realized_pnl += realized;

    LotAllocation {
        entries,
        fully_allocated: remaining_request.is_zero(),
        realized_pnl: realized,
    }
}

/// Replace every open lot's reference price (market RESET).
pub fn reset_prices(state: &mut PositionState, new_price: Decimal) {
    for lot in &mut state.open_lots {
        *lot = lot.with_ref_price(new_price);
    }
}

/// Per-entry realized P&L. LONG profits when close > basis; SHORT inverts.
fn realized_pnl(
    direction: Direction,
    cost_basis: Decimal,
    close_price: Decimal,
    quantity: Decimal,
) -> Decimal {
    match direction {
        Direction::Long => (close_price - cost_basis) * quantity,
        Direction::Short => (cost_basis - close_price) * quantity,
    }
}

/// Indices of open lots in consumption order for `method`.
///
/// FIFO: trade_date ascending, ties by insertion order.
/// LIFO: trade_date descending, ties by insertion order.
/// HIFO: cost_basis descending, ties broken FIFO.
fn consumption_order(lots: &[TaxLot], method: TaxLotMethod) -> Vec<usize> {
    let mut order: Vec<usize> = (0..lots.len()).collect();
    match method {
        TaxLotMethod::Fifo => {
            order.sort_by(|&a, &b| lots[a].trade_date.cmp(&lots[b].trade_date));
        }
        TaxLotMethod::Lifo => {
            order.sort_by(|&a, &b| lots[b].trade_date.cmp(&lots[a].trade_date));
        }
        TaxLotMethod::Hifo => {
            order.sort_by(|&a, &b| {
                lots[b]
                    .cost_basis
                    .cmp(&lots[a].cost_basis)
                    .then(lots[a].trade_date.cmp(&lots[b].trade_date))
            });
        }
    }
    order
}

fn upsert_schedule_point(schedule: &mut Vec<SchedulePoint>, point: SchedulePoint) {
    match schedule.binary_search_by(|p| p.date.cmp(&point.date)) {
        Ok(i) => schedule[i] = point,
        Err(i) => schedule.insert(i, point),
    }
}
