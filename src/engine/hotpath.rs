//! Hotpath trade processor.
//!
//! Per-trade apply for current- and forward-dated trades. The dispatcher
//! serializes calls per position key, so the processor never races itself
//! on one position; the optimistic-lock retry exists for the day that
//! assumption breaks, not as a normal path.
//!
//! The event append, snapshot save and idempotency record commit in one
//! SQLite transaction. The cache refresh afterwards is advisory: a crash
//! between commit and cache update leaves a stale entry that the next load
//! simply overwrites.

use crate::bus::SharedProducer;
use crate::cache::{CacheExt, SharedCache};
use crate::config::Topics;
use crate::engine::classifier::Classifier;
use crate::engine::contracts::ContractRulesResolver;
use crate::engine::error::EngineError;
use crate::engine::events::{EventType, PositionEvent};
use crate::engine::lots::{self, LotAllocation};
use crate::engine::position_key::{partition, position_key};
use crate::engine::state::{PositionState, PositionStatus};
use crate::engine::state_machine::{self, LifecycleState};
use crate::engine::validation::lifecycle_of;
use crate::models::{DatedClass, Trade, TradeType};
use crate::store::{
    event_store, idempotency_store, lifecycle, snapshot_store, Database, IdempotencyRecord,
    LifecycleEvent, PositionSnapshot,
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache key prefix for position snapshots.
pub fn position_cache_key(key: &str) -> String {
    format!("position:{}", key)
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Applied {
        position_key: String,
        event_ver: u64,
        snapshot: PositionSnapshot,
    },
    /// The trade id was already recorded; the cached outcome stands.
    Duplicate(IdempotencyRecord),
    /// Backdated: handed to the coldpath via the bus.
    RoutedToColdpath { position_key: String },
}

pub struct HotpathProcessor {
    db: Database,
    cache: SharedCache,
    contracts: Arc<ContractRulesResolver>,
    producer: SharedProducer,
    classifier: Classifier,
    topics: Topics,
    partitions_count: u32,
    save_retry_limit: u32,
}

impl HotpathProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        cache: SharedCache,
        contracts: Arc<ContractRulesResolver>,
        producer: SharedProducer,
        classifier: Classifier,
        topics: Topics,
        partitions_count: u32,
        save_retry_limit: u32,
    ) -> Self {
        Self {
            db,
            cache,
            contracts,
            producer,
            classifier,
            topics,
            partitions_count,
            save_retry_limit,
        }
    }

    /// Apply one trade end to end. See the module docs for the
    /// transactional boundary.
    pub async fn process(&self, mut trade: Trade) -> Result<ProcessOutcome, EngineError> {
        // 1. Idempotency short-circuit.
        if let Some(record) = self.db.idempotency().check(&trade.trade_id)? {
            debug!(trade_id = %trade.trade_id, "duplicate trade; returning cached outcome");
            counter!("posengine_duplicate_trades", 1);
            return Ok(ProcessOutcome::Duplicate(record));
        }

        // 2. Derive the position key when the feed did not precompute it.
        let key = match &trade.position_key {
            Some(k) => k.clone(),
            None => {
                let derived = position_key(
                    &trade.account,
                    &trade.instrument,
                    &trade.currency,
                    trade.direction,
                )?;
                trade.position_key = Some(derived.clone());
                derived
            }
        };
        let partition_no = partition(&key, self.partitions_count)?;

        // 3. Classify; backdated trades detour through the coldpath.
        let snapshot = self.load_position(&key).await?;
        let class = self
            .classifier
            .classify(trade.effective_date, snapshot.as_ref().and_then(|s| s.last_effective_date));
        trade.dated_class = Some(class);
        if class == DatedClass::Backdated {
            info!(
                trade_id = %trade.trade_id,
                position_key = %key,
                effective_date = %trade.effective_date,
                "backdated trade; routing to coldpath"
            );
            counter!("posengine_backdated_routed", 1);
            let payload = serde_json::to_vec(&trade)?;
            self.producer
                .send(&self.topics.backdated_trades, &key, payload)
                .await?;
            return Ok(ProcessOutcome::RoutedToColdpath { position_key: key });
        }

        // 4-9 with optimistic retry: reload and reapply on conflict.
        let mut attempt = 0u32;
        loop {
            match self.apply_once(&trade, &key, partition_no).await {
                Err(EngineError::VersionConflict(reason)) if attempt < self.save_retry_limit => {
                    attempt += 1;
                    warn!(
                        trade_id = %trade.trade_id,
                        position_key = %key,
                        attempt,
                        %reason,
                        "optimistic lock conflict; retrying from snapshot load"
                    );
                    counter!("posengine_save_conflicts", 1);
                    // The cached snapshot is stale by definition here.
                    self.cache.evict(&position_cache_key(&key)).await;
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                other => return other,
            }
        }
    }

    /// Steps 4-9 of the apply sequence, one attempt.
    async fn apply_once(
        &self,
        trade: &Trade,
        key: &str,
        partition_no: u32,
    ) -> Result<ProcessOutcome, EngineError> {
        // 4. Load (cache -> store -> fresh state).
        let prior_snapshot = self.load_position(key).await?;
        let prior_status = prior_snapshot.as_ref().map(|s| s.status);
        let mut state = match &prior_snapshot {
            Some(snapshot) => snapshot.to_state()?,
            None => PositionState::new(
                key.to_string(),
                trade.account.clone(),
                trade.instrument.clone(),
                trade.currency.clone(),
                trade.direction,
                trade.contract_id.clone(),
            ),
        };
        let expected_version = prior_snapshot.as_ref().map(|s| s.version).unwrap_or(0);

        // 5. Lifecycle validation with the real post-trade quantity. A
        // reduction can only consume what is open, so the projected total
        // clamps at flat rather than crossing zero.
        let current_lifecycle = lifecycle_of(prior_snapshot.as_ref());
        let quantity_after = projected_total(&state, trade);
        let transition =
            state_machine::transition(current_lifecycle, trade.trade_type, quantity_after)?;

        // 6. Mutate lots.
        let allocation = self.mutate(&mut state, trade).await;
        if !allocation.fully_allocated {
            warn!(
                trade_id = %trade.trade_id,
                position_key = %key,
                requested = %trade.quantity,
                "reduction exceeded open quantity; under-allocated"
            );
            counter!("posengine_under_allocations", 1);
        }
        state.contract_id = state.contract_id.clone().or_else(|| trade.contract_id.clone());
        state.mark_applied(trade.effective_date);
        state.status = match transition.new_state {
            LifecycleState::Terminated => PositionStatus::Terminated,
            _ => PositionStatus::Active,
        };

        // 7-9. Event append + snapshot save + idempotency in one txn.
        let closed = state.status == PositionStatus::Terminated;
        let trade_event_type = EventType::from_trade_type(trade.trade_type);
        let (event_ver, snapshot) = self.db.with_transaction(|conn| {
            let next_ver = event_store::next_version_in(conn, key)?;
            let event = PositionEvent::from_trade(
                trade,
                key,
                partition_no,
                next_ver,
                trade_event_type,
                Some(allocation.clone()),
            )
            .map_err(engine_to_store)?;
            event_store::append_in(conn, &event)?;

            let mut last_ver = next_ver;
            if closed {
                // Lifecycle marker event; skipped on replay.
                last_ver = next_ver + 1;
                let marker = PositionEvent {
                    event_ver: last_ver,
                    event_type: EventType::PositionClosed,
                    payload: serde_json::json!({
                        "tradeId": trade.trade_id,
                        "closedBy": trade.trade_type.as_str(),
                    }),
                    meta_lots: None,
                    ..event.clone()
                };
                event_store::append_in(conn, &marker)?;
                state.mark_applied(trade.effective_date);
            }

            let snapshot = PositionSnapshot::from_state(&state, last_ver, Utc::now());
            let new_version = snapshot_store::save_in(conn, &snapshot, expected_version)?;

            idempotency_store::record_in(
                conn,
                &IdempotencyRecord::processed(&trade.trade_id, key, next_ver),
            )?;

            if let Some(lifecycle_event) =
                lifecycle_change(prior_status, trade.trade_type, closed, transition.state_changed)
            {
                lifecycle::record_lifecycle_in(
                    conn,
                    key,
                    lifecycle_event,
                    next_ver,
                    Some(format!("trade {}", trade.trade_id)),
                )?;
            }

            let mut persisted = snapshot;
            persisted.version = new_version;
            Ok((next_ver, persisted))
        })?;

        // 10. Advisory cache refresh.
        self.cache
            .put(&position_cache_key(key), &snapshot, None)
            .await;

        counter!("posengine_trades_applied", 1);
        info!(
            trade_id = %trade.trade_id,
            position_key = %key,
            event_ver,
            total_qty = %snapshot.total_qty,
            status = snapshot.status.as_str(),
            "trade applied"
        );

        Ok(ProcessOutcome::Applied {
            position_key: key.to_string(),
            event_ver,
            snapshot,
        })
    }

    async fn mutate(&self, state: &mut PositionState, trade: &Trade) -> LotAllocation {
        match trade.trade_type {
            TradeType::NewTrade | TradeType::Increase => lots::add_lot(
                state,
                trade.signed_delta(),
                trade.price,
                trade.effective_date,
                trade.settlement_date,
            ),
            TradeType::Decrease => {
                let rules = self.contracts.resolve(trade.contract_id.as_deref()).await;
                lots::reduce_lots(state, trade.quantity.abs(), rules.tax_lot_method, trade.price)
            }
        }
    }

    /// Snapshot lookup: cache first, store second, `None` for a fresh key.
    pub async fn load_position(&self, key: &str) -> Result<Option<PositionSnapshot>, EngineError> {
        if let Some(cached) = self.cache.get::<PositionSnapshot>(&position_cache_key(key)).await {
            return Ok(Some(cached));
        }
        let loaded = self.db.snapshots().load(key)?;
        if let Some(snapshot) = &loaded {
            self.cache
                .put(&position_cache_key(key), snapshot, None)
                .await;
        }
        Ok(loaded)
    }
}

/// Post-trade total, clamping reductions at flat (never over-close).
fn projected_total(state: &PositionState, trade: &Trade) -> Decimal {
    let total = state.total_qty();
    match trade.trade_type {
        TradeType::NewTrade | TradeType::Increase => total + trade.signed_delta(),
        TradeType::Decrease => {
            let available = total.abs();
            let applied = trade.quantity.abs().min(available);
            total - trade.direction.sign() * applied
        }
    }
}

fn lifecycle_change(
    prior_status: Option<PositionStatus>,
    trade_type: TradeType,
    closed: bool,
    state_changed: bool,
) -> Option<LifecycleEvent> {
    if closed {
        return Some(LifecycleEvent::Terminated);
    }
    if trade_type == TradeType::NewTrade && state_changed {
        return Some(match prior_status {
            Some(PositionStatus::Terminated) => LifecycleEvent::Reopened,
            _ => LifecycleEvent::Created,
        });
    }
    None
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(25u64 << attempt.min(6))
}

fn engine_to_store(e: EngineError) -> crate::store::StoreError {
    crate::store::StoreError::Corrupt(e.to_string())
}
