//! In-memory position aggregate.
//!
//! No thread-safety of its own: the dispatcher hashes every position key to
//! a single worker, so each aggregate only ever sees one thread.

use crate::engine::lots::TaxLot;
use crate::models::Direction;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Position lifecycle status as persisted. The NON_EXISTENT state of the
/// transition machine is represented by the absence of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Active,
    Terminated,
}

impl PositionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Terminated => "TERMINATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(PositionStatus::Active),
            "TERMINATED" => Some(PositionStatus::Terminated),
            _ => None,
        }
    }
}

/// Whether the snapshot reflects a settled view of history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Reconciled,
    /// A backdated recalculation is in flight; `provisional_trade_id`
    /// names the trade that opened the window.
    Provisional,
    /// Needs operator attention (e.g. corrupt event skipped on replay).
    Pending,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ReconciliationStatus::Reconciled => "RECONCILED",
            ReconciliationStatus::Provisional => "PROVISIONAL",
            ReconciliationStatus::Pending => "PENDING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RECONCILED" => Some(ReconciliationStatus::Reconciled),
            "PROVISIONAL" => Some(ReconciliationStatus::Provisional),
            "PENDING" => Some(ReconciliationStatus::Pending),
            _ => None,
        }
    }
}

/// One point of the price/quantity schedule, kept sorted by date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulePoint {
    pub date: NaiveDate,
    pub quantity: Decimal,
    pub price: Decimal,
}

/// The live aggregate for one `(account, instrument, currency, direction)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub position_key: String,
    pub account: String,
    pub instrument: String,
    pub currency: String,
    pub direction: Direction,
    pub contract_id: Option<String>,
    /// Insertion order is arrival order; method ordering is computed per
    /// reduction, never by reordering this list.
    pub open_lots: Vec<TaxLot>,
    /// Count of applied events; advances by exactly one per event.
    pub version: u64,
    pub status: PositionStatus,
    pub reconciliation_status: ReconciliationStatus,
    pub provisional_trade_id: Option<String>,
    pub price_quantity_schedule: Vec<SchedulePoint>,
    /// Latest effective date applied; drives backdated classification.
    pub last_effective_date: Option<NaiveDate>,
    /// Cumulative realized P&L across reductions.
    pub realized_pnl: Decimal,
}

impl PositionState {
    pub fn new(
        position_key: String,
        account: String,
        instrument: String,
        currency: String,
        direction: Direction,
        contract_id: Option<String>,
    ) -> Self {
        Self {
            position_key,
            account,
            instrument,
            currency,
            direction,
            contract_id,
            open_lots: Vec::new(),
            version: 0,
            status: PositionStatus::Active,
            reconciliation_status: ReconciliationStatus::Reconciled,
            provisional_trade_id: None,
            price_quantity_schedule: Vec::new(),
            last_effective_date: None,
            realized_pnl: Decimal::ZERO,
        }
    }

    /// Signed net quantity: the sum of every open lot's remaining quantity.
    pub fn total_qty(&self) -> Decimal {
        self.open_lots.iter().map(|l| l.remaining_qty).sum()
    }

    pub fn is_flat(&self) -> bool {
        self.total_qty().is_zero() && self.open_lots.is_empty()
    }

    /// Record an applied event: bump the version and roll the latest
    /// effective date forward (never backward; coldpath rebuilds instead).
    pub fn mark_applied(&mut self, effective_date: NaiveDate) {
        self.version += 1;
        match self.last_effective_date {
            Some(prev) if prev >= effective_date => {}
            _ => self.last_effective_date = Some(effective_date),
        }
    }
}
