//! Coldpath recalculator for backdated trades.
//!
//! A backdated trade never rewrites history in place: the log stays
//! append-only in storage order, and logical order is always reconstructed
//! from `(effective_date, occurred_at, event_ver)`. The recalculation
//! replays everything before the backdated effective date as a baseline,
//! inserts the trade, replays the tail, and appends the outcome as fresh
//! events: one PROVISIONAL_TRADE_APPLIED, one CORRECTION per downstream
//! event whose allocation materially changed, and one
//! HISTORICAL_POSITION_CORRECTED summary.
//!
//! Failure semantics: the snapshot is flipped to PROVISIONAL up front in
//! its own save. If anything later fails, it stays PROVISIONAL and the
//! stale-provisional sweep surfaces it for an operator re-drive.

use crate::bus::SharedProducer;
use crate::cache::{CacheExt, SharedCache};
use crate::config::Topics;
use crate::engine::contracts::ContractRulesResolver;
use crate::engine::error::EngineError;
use crate::engine::events::{
    CorrectionPayload, EventType, HistoricalCorrectionPayload, PositionEvent, TradePayload,
};
use crate::engine::hotpath::position_cache_key;
use crate::engine::lots::{LotAllocation, TaxLot};
use crate::engine::position_key::partition;
use crate::engine::replay::ReplayRun;
use crate::engine::state::{PositionStatus, ReconciliationStatus};
use crate::models::Trade;
use crate::store::{
    event_store, idempotency_store, lifecycle, snapshot_store, Database, IdempotencyRecord,
    LifecycleEvent, PositionSnapshot, ReconciliationBreak,
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug)]
pub enum ColdpathOutcome {
    Recalculated {
        position_key: String,
        corrections_emitted: usize,
        snapshot: PositionSnapshot,
    },
    Duplicate(IdempotencyRecord),
}

pub struct ColdpathRecalculator {
    db: Database,
    cache: SharedCache,
    contracts: Arc<ContractRulesResolver>,
    producer: SharedProducer,
    topics: Topics,
    partitions_count: u32,
}

impl ColdpathRecalculator {
    pub fn new(
        db: Database,
        cache: SharedCache,
        contracts: Arc<ContractRulesResolver>,
        producer: SharedProducer,
        topics: Topics,
        partitions_count: u32,
    ) -> Self {
        Self {
            db,
            cache,
            contracts,
            producer,
            topics,
            partitions_count,
        }
    }

    pub async fn recalculate(&self, trade: Trade) -> Result<ColdpathOutcome, EngineError> {
        if let Some(record) = self.db.idempotency().check(&trade.trade_id)? {
            return Ok(ColdpathOutcome::Duplicate(record));
        }

        let key = trade
            .position_key
            .clone()
            .ok_or_else(|| EngineError::InvalidArgument("coldpath trade without position key".into()))?;
        let partition_no = partition(&key, self.partitions_count)?;

        let Some(prior) = self.db.snapshots().load(&key)? else {
            return Err(EngineError::InvalidArgument(format!(
                "backdated trade {} targets unknown position {}",
                trade.trade_id, key
            )));
        };

        // 1. Open the provisional window in its own save.
        let mut provisional = prior.clone();
        provisional.reconciliation_status = ReconciliationStatus::Provisional;
        provisional.provisional_trade_id = Some(trade.trade_id.clone());
        provisional.last_updated_at = Utc::now();
        let provisional_version = self
            .db
            .snapshots()
            .save(&provisional, prior.version)?;
        counter!("posengine_coldpath_runs", 1);

        // 2-3. Full history, split at the backdated effective date. Events
        // sharing the trade's effective date belong to the baseline: their
        // transaction time predates this trade's, so canonical order puts
        // them first.
        let events = self.db.events().list(&key)?;
        let (before, after): (Vec<PositionEvent>, Vec<PositionEvent>) = events
            .into_iter()
            .partition(|e| e.effective_date <= trade.effective_date);

        let method = self
            .contracts
            .resolve(prior.contract_id.as_deref())
            .await
            .tax_lot_method;

        // 4. Baseline replay.
        let mut replay = ReplayRun::new(&prior, method);
        for event in &before {
            replay.apply(event);
        }

        // 5. Insert the backdated trade at its proper point.
        let backdated_allocation = replay.apply_trade(&TradePayload::from(&trade));

        // 6. Replay the tail, collecting recomputed allocations.
        let mut corrections = Vec::new();
        for event in &after {
            let recomputed = replay.apply(event);
            if !event.event_type.is_replayable() {
                continue;
            }
            if let Some(recomputed) = recomputed {
                if allocations_differ(event.meta_lots.as_ref(), Some(&recomputed)) {
                    corrections.push((event.clone(), recomputed));
                }
            }
        }

        let mut state = replay.state;
        let corrupt_events = replay.corrupt_events;
        state.status = if state.total_qty().is_zero() && state.open_lots.is_empty() {
            PositionStatus::Terminated
        } else {
            PositionStatus::Active
        };
        state.reconciliation_status = if corrupt_events.is_empty() {
            ReconciliationStatus::Reconciled
        } else {
            ReconciliationStatus::Pending
        };
        state.provisional_trade_id = None;

        // 7. Materialize the correction events at fresh versions.
        let prior_lots = crate::engine::codec::inflate(&prior.lots)?;
        let (lots_added, lots_removed) = lot_set_delta(&prior_lots, &state.open_lots);
        let summary = HistoricalCorrectionPayload {
            backdated_trade_id: trade.trade_id.clone(),
            prior_total_qty: prior.total_qty,
            new_total_qty: state.total_qty(),
            prior_realized_pnl: prior.realized_pnl,
            new_realized_pnl: state.realized_pnl,
            lots_added,
            lots_removed,
            corrected_events: corrections.len() as u64,
        };

        let mut published: Vec<(String, Vec<u8>)> = Vec::new();
        let trade_payload = TradePayload::from(&trade);
        let corrections_emitted = corrections.len();

        // 8. Append provisional + corrections + summary, rewrite the
        // snapshot and record idempotency, all in one transaction.
        let snapshot = self.db.with_transaction(|conn| {
            let mut next_ver = event_store::next_version_in(conn, &key)?;
            let provisional_ver = next_ver;

            let provisional_event = PositionEvent {
                position_key: key.clone(),
                event_ver: next_ver,
                partition_no,
                event_type: EventType::ProvisionalTradeApplied,
                effective_date: trade.effective_date,
                occurred_at: Utc::now(),
                payload: serde_json::to_value(&trade_payload)?,
                meta_lots: Some(backdated_allocation.clone()),
                correlation_id: trade.correlation_id.clone(),
                causation_id: trade.causation_id.clone(),
                contract_id: trade.contract_id.clone(),
                user_id: trade.user_id.clone(),
                archival_flag: false,
            };
            event_store::append_in(conn, &provisional_event)?;

            for (original, recomputed) in &corrections {
                next_ver += 1;
                let payload = CorrectionPayload {
                    corrected_event_ver: original.event_ver,
                    backdated_trade_id: trade.trade_id.clone(),
                    previous: original.meta_lots.clone(),
                    recomputed: Some(recomputed.clone()),
                };
                let correction = PositionEvent {
                    position_key: key.clone(),
                    event_ver: next_ver,
                    partition_no,
                    event_type: EventType::Correction,
                    effective_date: original.effective_date,
                    occurred_at: Utc::now(),
                    payload: serde_json::to_value(&payload)?,
                    meta_lots: Some(recomputed.clone()),
                    correlation_id: trade.correlation_id.clone(),
                    causation_id: Some(original.event_id()),
                    contract_id: trade.contract_id.clone(),
                    user_id: trade.user_id.clone(),
                    archival_flag: false,
                };
                event_store::append_in(conn, &correction)?;
                published.push((key.clone(), serde_json::to_vec(&payload)?));
            }

            next_ver += 1;
            let summary_event = PositionEvent {
                position_key: key.clone(),
                event_ver: next_ver,
                partition_no,
                event_type: EventType::HistoricalPositionCorrected,
                effective_date: state.last_effective_date.unwrap_or(trade.effective_date),
                occurred_at: Utc::now(),
                payload: serde_json::to_value(&summary)?,
                meta_lots: None,
                correlation_id: trade.correlation_id.clone(),
                causation_id: trade.causation_id.clone(),
                contract_id: trade.contract_id.clone(),
                user_id: trade.user_id.clone(),
                archival_flag: false,
            };
            event_store::append_in(conn, &summary_event)?;
            published.push((key.clone(), serde_json::to_vec(&summary)?));

            // Replay already counted every applied event; the snapshot's
            // last_ver must cover the markers appended here as well.
            state.version = next_ver;
            let snapshot = PositionSnapshot::from_state(&state, next_ver, Utc::now());
            let new_version = snapshot_store::save_in(conn, &snapshot, provisional_version)?;

            idempotency_store::record_in(
                conn,
                &IdempotencyRecord::processed(&trade.trade_id, &key, provisional_ver),
            )?;

            lifecycle::record_lifecycle_in(
                conn,
                &key,
                LifecycleEvent::Corrected,
                provisional_ver,
                Some(format!(
                    "backdated trade {} corrected {} events",
                    trade.trade_id, corrections_emitted
                )),
            )?;

            let mut persisted = snapshot;
            persisted.version = new_version;
            Ok(persisted)
        })?;

        // Skipped-corruption path: leave a break row for tooling.
        for event_id in &corrupt_events {
            error!(position_key = %key, event_id = %event_id, "corrupt event skipped during replay");
            self.db.lifecycle().record_break(&ReconciliationBreak::new(
                &key,
                "CORRUPT_EVENT_SKIPPED",
                format!("event {} skipped during coldpath replay", event_id),
            ))?;
        }

        // 9. Publish corrections after commit.
        for (topic_key, payload) in published {
            self.producer
                .send(&self.topics.corrections, &topic_key, payload)
                .await?;
        }

        // Cache refresh, advisory as ever.
        self.cache
            .put(&position_cache_key(&key), &snapshot, None)
            .await;

        counter!("posengine_coldpath_corrections", corrections_emitted as u64);
        info!(
            trade_id = %trade.trade_id,
            position_key = %key,
            corrections = corrections_emitted,
            total_qty = %snapshot.total_qty,
            "backdated trade reconciled"
        );

        Ok(ColdpathOutcome::Recalculated {
            position_key: key,
            corrections_emitted,
            snapshot,
        })
    }
}

/// Replay regenerates lot ids, so allocation comparison is by effect:
/// quantities, prices and realized P&L in consumption order.
fn allocations_differ(previous: Option<&LotAllocation>, recomputed: Option<&LotAllocation>) -> bool {
    match (previous, recomputed) {
        (None, None) => false,
        (None, Some(_)) | (Some(_), None) => true,
        (Some(a), Some(b)) => {
            if a.fully_allocated != b.fully_allocated
                || a.realized_pnl != b.realized_pnl
                || a.entries.len() != b.entries.len()
            {
                return true;
            }
            a.entries.iter().zip(b.entries.iter()).any(|(x, y)| {
                x.quantity != y.quantity
                    || x.price != y.price
                    || x.realized_pnl != y.realized_pnl
            })
        }
    }
}

/// Multiset delta of lots keyed by `(trade_date, original_qty, cost_basis)`;
/// ids are not comparable across a replay.
fn lot_set_delta(prior: &[TaxLot], current: &[TaxLot]) -> (u64, u64) {
    use std::collections::HashMap;
    let mut counts: HashMap<(chrono::NaiveDate, Decimal, Decimal), i64> = HashMap::new();
    for lot in current {
        *counts
            .entry((lot.trade_date, lot.original_qty, lot.cost_basis))
            .or_insert(0) += 1;
    }
    for lot in prior {
        *counts
            .entry((lot.trade_date, lot.original_qty, lot.cost_basis))
            .or_insert(0) -= 1;
    }
    let added = counts.values().filter(|&&c| c > 0).sum::<i64>().max(0) as u64;
    let removed = (-counts.values().filter(|&&c| c < 0).sum::<i64>()).max(0) as u64;
    (added, removed)
}
