//! Event replay.
//!
//! Rebuilds a position aggregate from its stored events. Storage order is
//! `event_ver`-ascending, but replay consumes events in canonical order
//! `(effective_date, occurred_at, event_ver)` — the event store's `list`
//! already yields that.
//!
//! Only trade-shaped events mutate lots: NEW_TRADE / INCREASE / DECREASE,
//! RESET (reference prices), and PROVISIONAL_TRADE_APPLIED, which replays
//! as the backdated trade it carries. CORRECTION, POSITION_CLOSED and
//! HISTORICAL_POSITION_CORRECTED are derived markers and are skipped. A
//! corrupt payload is skipped too, but remembered, so callers can flag the
//! position PENDING and alert.

use crate::engine::events::{EventType, PositionEvent, TradePayload};
use crate::engine::lots::{self, LotAllocation};
use crate::engine::state::PositionState;
use crate::models::{TaxLotMethod, TradeType};
use crate::store::PositionSnapshot;
use rust_decimal::Decimal;
use tracing::warn;

/// Incremental replay over a fresh aggregate.
pub struct ReplayRun {
    pub state: PositionState,
    method: TaxLotMethod,
    /// Event ids whose payloads failed to decode and were skipped.
    pub corrupt_events: Vec<String>,
}

impl ReplayRun {
    /// Start from the identity of an existing snapshot (the lots are NOT
    /// carried over; they are rebuilt by the replay).
    pub fn new(prior: &PositionSnapshot, method: TaxLotMethod) -> Self {
        Self {
            state: PositionState::new(
                prior.position_key.clone(),
                prior.account.clone(),
                prior.instrument.clone(),
                prior.currency.clone(),
                prior.direction,
                prior.contract_id.clone(),
            ),
            method,
            corrupt_events: Vec::new(),
        }
    }

    /// Apply one stored event; returns the recomputed allocation for
    /// replayable trade events.
    pub fn apply(&mut self, event: &PositionEvent) -> Option<LotAllocation> {
        if !event.event_type.is_replayable() {
            self.state.mark_applied(event.effective_date);
            return None;
        }
        if event.event_type == EventType::Reset {
            if let Some(price) = event.payload.get("price").and_then(reset_price) {
                lots::reset_prices(&mut self.state, price);
            }
            self.state.mark_applied(event.effective_date);
            return None;
        }
        match event.trade_payload() {
            Ok(payload) => Some(self.apply_trade(&payload)),
            Err(e) => {
                warn!(event_id = %event.event_id(), error = %e, "skipping corrupt event in replay");
                self.corrupt_events.push(event.event_id());
                None
            }
        }
    }

    /// Apply a trade payload directly (used to insert a backdated trade at
    /// its proper point in the sequence).
    pub fn apply_trade(&mut self, payload: &TradePayload) -> LotAllocation {
        let allocation = match payload.trade_type {
            TradeType::NewTrade | TradeType::Increase => lots::add_lot(
                &mut self.state,
                payload.signed_delta(),
                payload.price,
                payload.effective_date,
                payload.settlement_date,
            ),
            TradeType::Decrease => lots::reduce_lots(
                &mut self.state,
                payload.quantity.abs(),
                self.method,
                payload.price,
            ),
        };
        self.state.mark_applied(payload.effective_date);
        allocation
    }
}

/// Rebuild a position wholesale from its canonical-order event sequence.
pub fn rebuild(
    prior: &PositionSnapshot,
    events: &[PositionEvent],
    method: TaxLotMethod,
) -> ReplayRun {
    let mut run = ReplayRun::new(prior, method);
    for event in events {
        run.apply(event);
    }
    run
}

fn reset_price(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}
