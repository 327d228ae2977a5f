//! Replay-vs-snapshot reconciliation.
//!
//! For every settled position, replaying the stored event sequence must
//! land exactly on the stored snapshot. This checker re-derives each
//! position from its log and writes a `reconciliation_breaks` row for any
//! divergence — quantity, realized P&L, or the lot book itself. Positions
//! inside a PROVISIONAL window are skipped; the coldpath owns them.

use crate::engine::contracts::ContractRulesResolver;
use crate::engine::error::EngineError;
use crate::engine::lots::TaxLot;
use crate::engine::replay;
use crate::engine::state::ReconciliationStatus;
use crate::store::{Database, ReconciliationBreak};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SWEEP_PAGE_SIZE: usize = 200;

pub struct ReconciliationChecker {
    db: Database,
    contracts: Arc<ContractRulesResolver>,
}

impl ReconciliationChecker {
    pub fn new(db: Database, contracts: Arc<ContractRulesResolver>) -> Self {
        Self { db, contracts }
    }

    /// Re-derive one position from its event log and compare. Returns the
    /// break description when the snapshot diverges.
    pub async fn check_position(&self, position_key: &str) -> Result<Option<String>, EngineError> {
        let Some(snapshot) = self.db.snapshots().load(position_key)? else {
            return Ok(None);
        };
        if snapshot.reconciliation_status == ReconciliationStatus::Provisional {
            debug!(position_key, "skipping provisional position");
            return Ok(None);
        }

        let events = self.db.events().list(position_key)?;
        let method = self
            .contracts
            .resolve(snapshot.contract_id.as_deref())
            .await
            .tax_lot_method;
        let run = replay::rebuild(&snapshot, &events, method);

        let mut diffs = Vec::new();
        let replayed_total = run.state.total_qty();
        if replayed_total != snapshot.total_qty {
            diffs.push(format!(
                "total_qty: snapshot {} vs replay {}",
                snapshot.total_qty, replayed_total
            ));
        }
        if run.state.realized_pnl != snapshot.realized_pnl {
            diffs.push(format!(
                "realized_pnl: snapshot {} vs replay {}",
                snapshot.realized_pnl, run.state.realized_pnl
            ));
        }
        let stored_lots = crate::engine::codec::inflate(&snapshot.lots)?;
        if !lots_equivalent(&stored_lots, &run.state.open_lots) {
            diffs.push(format!(
                "open lots: snapshot has {}, replay has {}",
                stored_lots.len(),
                run.state.open_lots.len()
            ));
        }
        for event_id in &run.corrupt_events {
            diffs.push(format!("corrupt event skipped: {}", event_id));
        }

        if diffs.is_empty() {
            return Ok(None);
        }

        let detail = diffs.join("; ");
        warn!(position_key, %detail, "replay diverges from snapshot");
        counter!("posengine_reconciliation_breaks", 1);
        self.db.lifecycle().record_break(&ReconciliationBreak::new(
            position_key,
            "REPLAY_MISMATCH",
            detail.clone(),
        ))?;
        Ok(Some(detail))
    }

    /// One pass over every snapshot, paged. Returns the break count.
    pub async fn sweep_once(&self) -> Result<usize, EngineError> {
        let mut offset = 0usize;
        let mut breaks = 0usize;
        loop {
            let keys = self.db.snapshots().list_keys(SWEEP_PAGE_SIZE, offset)?;
            if keys.is_empty() {
                break;
            }
            offset += keys.len();
            for key in keys {
                match self.check_position(&key).await {
                    Ok(Some(_)) => breaks += 1,
                    Ok(None) => {}
                    Err(e) => warn!(position_key = %key, error = %e, "reconciliation check failed"),
                }
            }
        }
        if breaks > 0 {
            info!(breaks, "reconciliation sweep found divergent positions");
        }
        Ok(breaks)
    }

    /// Periodic driver; runs until the task is aborted.
    pub async fn run(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "reconciliation sweep failed");
            }
        }
    }
}

/// Lot books are equivalent when they agree on the multiset of
/// `(trade_date, remaining_qty, cost_basis)`; ids differ across replays.
fn lots_equivalent(a: &[TaxLot], b: &[TaxLot]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut left: Vec<_> = a
        .iter()
        .map(|l| (l.trade_date, l.remaining_qty, l.cost_basis))
        .collect();
    let mut right: Vec<_> = b
        .iter()
        .map(|l| (l.trade_date, l.remaining_qty, l.cost_basis))
        .collect();
    left.sort();
    right.sort();
    left == right
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::engine::contracts::MockContractService;
    use crate::engine::events::{EventType, PositionEvent};
    use crate::engine::lots::add_lot;
    use crate::engine::state::PositionState;
    use crate::models::{Direction, TaxLotMethod, Trade, TradeType};
    use crate::store::PositionSnapshot;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    fn checker(db: &Database) -> ReconciliationChecker {
        ReconciliationChecker::new(
            db.clone(),
            Arc::new(ContractRulesResolver::new(
                Arc::new(MockContractService::new(TaxLotMethod::Fifo)),
                Arc::new(MemoryCache::new()),
                Duration::from_secs(60),
                TaxLotMethod::Fifo,
            )),
        )
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, day).unwrap()
    }

    /// One NEW_TRADE event plus the snapshot its replay produces.
    fn seed_position(db: &Database, key: &str, qty: rust_decimal::Decimal) -> PositionState {
        let trade = Trade {
            trade_id: format!("T-{}", key.chars().next().unwrap()),
            account: "ACC".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            direction: Direction::Long,
            position_key: Some(key.to_string()),
            trade_type: TradeType::NewTrade,
            quantity: qty,
            price: dec!(50),
            effective_date: d(1),
            settlement_date: None,
            contract_id: None,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            dated_class: None,
        };
        let event = PositionEvent::from_trade(&trade, key, 0, 1, EventType::NewTrade, None).unwrap();
        db.events().append(&event).unwrap();

        let mut state = PositionState::new(
            key.to_string(),
            "ACC".into(),
            "AAPL".into(),
            "USD".into(),
            Direction::Long,
            None,
        );
        add_lot(&mut state, qty, dec!(50), d(1), None);
        state.mark_applied(d(1));
        state
    }

    #[tokio::test]
    async fn consistent_position_produces_no_break() {
        let db = Database::in_memory().unwrap();
        let key = "a".repeat(64);
        let state = seed_position(&db, &key, dec!(100));
        let snapshot = PositionSnapshot::from_state(&state, 1, Utc::now());
        db.snapshots().save(&snapshot, 0).unwrap();

        let outcome = checker(&db).check_position(&key).await.unwrap();
        assert_eq!(outcome, None);
        assert!(db.lifecycle().open_breaks(&key).unwrap().is_empty());
    }

    #[tokio::test]
    async fn tampered_snapshot_is_flagged() {
        let db = Database::in_memory().unwrap();
        let key = "b".repeat(64);
        let mut state = seed_position(&db, &key, dec!(100));
        // Snapshot claims a quantity the log cannot produce.
        state.open_lots[0].remaining_qty = dec!(90);
        let snapshot = PositionSnapshot::from_state(&state, 1, Utc::now());
        db.snapshots().save(&snapshot, 0).unwrap();

        let outcome = checker(&db).check_position(&key).await.unwrap();
        assert!(outcome.unwrap().contains("total_qty"));
        let breaks = db.lifecycle().open_breaks(&key).unwrap();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].break_type, "REPLAY_MISMATCH");
    }

    #[tokio::test]
    async fn provisional_positions_are_left_alone() {
        let db = Database::in_memory().unwrap();
        let key = "c".repeat(64);
        let mut state = seed_position(&db, &key, dec!(100));
        state.open_lots[0].remaining_qty = dec!(90);
        state.reconciliation_status = ReconciliationStatus::Provisional;
        state.provisional_trade_id = Some("T-inflight".into());
        let snapshot = PositionSnapshot::from_state(&state, 1, Utc::now());
        db.snapshots().save(&snapshot, 0).unwrap();

        let outcome = checker(&db).check_position(&key).await.unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn sweep_covers_all_positions() {
        let db = Database::in_memory().unwrap();
        for (i, tamper) in [(0u8, false), (1, true), (2, false)] {
            let key = format!("{}", i).repeat(64);
            let mut state = seed_position(&db, &key, dec!(100));
            if tamper {
                state.open_lots[0].remaining_qty = dec!(1);
            }
            let snapshot = PositionSnapshot::from_state(&state, 1, Utc::now());
            db.snapshots().save(&snapshot, 0).unwrap();
        }

        let breaks = checker(&db).sweep_once().await.unwrap();
        assert_eq!(breaks, 1);
    }
}
