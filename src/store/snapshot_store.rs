//! Overwrite-on-update position snapshots.
//!
//! One row per position key, guarded by an optimistic-lock `version`
//! column: `save` rewrites the whole row only when the caller's expected
//! version still matches. Losers get `VersionConflict` and retry from a
//! fresh load. Lookup columns (`account`, `instrument`, `contract_id`) are
//! denormalized from the position on every save.

use crate::engine::codec::{self, CompressedLots};
use crate::engine::error::EngineError;
use crate::engine::state::{
    PositionState, PositionStatus, ReconciliationStatus, SchedulePoint,
};
use crate::models::Direction;
use crate::store::event_store::{decode_instant, encode_instant};
use crate::store::{map_constraint, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

/// The denormalized current state of a position, as persisted.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PositionSnapshot {
    pub position_key: String,
    pub account: String,
    pub instrument: String,
    pub currency: String,
    pub direction: Direction,
    pub contract_id: Option<String>,
    pub status: PositionStatus,
    pub reconciliation_status: ReconciliationStatus,
    pub provisional_trade_id: Option<String>,
    /// Highest non-archived event version applied.
    pub last_ver: u64,
    pub last_effective_date: Option<NaiveDate>,
    pub lots: CompressedLots,
    pub schedule: Vec<SchedulePoint>,
    pub summary_metrics: serde_json::Value,
    pub total_qty: Decimal,
    pub realized_pnl: Decimal,
    pub last_updated_at: DateTime<Utc>,
    /// Optimistic-lock column; bumps by one on every save.
    pub version: u64,
}

impl PositionSnapshot {
    /// Build the persisted form of a live aggregate.
    pub fn from_state(state: &PositionState, last_ver: u64, now: DateTime<Utc>) -> Self {
        let total_qty = state.total_qty();
        let summary_metrics = serde_json::json!({
            "totalQty": total_qty.to_string(),
            "openLotCount": state.open_lots.len(),
            "realizedPnl": state.realized_pnl.to_string(),
        });
        Self {
            position_key: state.position_key.clone(),
            account: state.account.clone(),
            instrument: state.instrument.clone(),
            currency: state.currency.clone(),
            direction: state.direction,
            contract_id: state.contract_id.clone(),
            status: state.status,
            reconciliation_status: state.reconciliation_status,
            provisional_trade_id: state.provisional_trade_id.clone(),
            last_ver,
            last_effective_date: state.last_effective_date,
            lots: codec::compress(&state.open_lots),
            schedule: state.price_quantity_schedule.clone(),
            summary_metrics,
            total_qty,
            realized_pnl: state.realized_pnl,
            last_updated_at: now,
            version: 0,
        }
    }

    /// Inflate back into a live aggregate.
    pub fn to_state(&self) -> Result<PositionState, EngineError> {
        Ok(PositionState {
            position_key: self.position_key.clone(),
            account: self.account.clone(),
            instrument: self.instrument.clone(),
            currency: self.currency.clone(),
            direction: self.direction,
            contract_id: self.contract_id.clone(),
            open_lots: codec::inflate(&self.lots)?,
            version: self.last_ver,
            status: self.status,
            reconciliation_status: self.reconciliation_status,
            provisional_trade_id: self.provisional_trade_id.clone(),
            price_quantity_schedule: self.schedule.clone(),
            last_effective_date: self.last_effective_date,
            realized_pnl: self.realized_pnl,
        })
    }
}

pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn load(&self, position_key: &str) -> Result<Option<PositionSnapshot>, StoreError> {
        load_in(&self.conn.lock(), position_key)
    }

    /// Full-row save with an optimistic check. `expected_version` is the
    /// version observed at load time (0 for a brand-new position); the
    /// stored row ends at `expected_version + 1`, which is returned.
    pub fn save(
        &self,
        snapshot: &PositionSnapshot,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        save_in(&self.conn.lock(), snapshot, expected_version)
    }

    pub fn find_by_account(
        &self,
        account: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PositionSnapshot>, StoreError> {
        self.query_page(
            "SELECT * FROM snapshot_store WHERE account = ?1
             ORDER BY position_key LIMIT ?2 OFFSET ?3",
            params![account, limit as i64, offset as i64],
        )
    }

    pub fn find_by_instrument(
        &self,
        instrument: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PositionSnapshot>, StoreError> {
        self.query_page(
            "SELECT * FROM snapshot_store WHERE instrument = ?1
             ORDER BY position_key LIMIT ?2 OFFSET ?3",
            params![instrument, limit as i64, offset as i64],
        )
    }

    pub fn find_by_contract(
        &self,
        contract_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PositionSnapshot>, StoreError> {
        self.query_page(
            "SELECT * FROM snapshot_store WHERE contract_id = ?1
             ORDER BY position_key LIMIT ?2 OFFSET ?3",
            params![contract_id, limit as i64, offset as i64],
        )
    }

    /// Stable page of position keys, for full-table sweeps.
    pub fn list_keys(&self, limit: usize, offset: usize) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT position_key FROM snapshot_store
             ORDER BY position_key LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| row.get(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Snapshots stuck in PROVISIONAL since before `older_than`.
    pub fn find_stale_provisional(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<PositionSnapshot>, StoreError> {
        self.query_page(
            "SELECT * FROM snapshot_store
             WHERE reconciliation_status = 'PROVISIONAL' AND last_updated_at < ?1
             ORDER BY last_updated_at",
            params![encode_instant(&older_than)],
        )
    }

    fn query_page(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<PositionSnapshot>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| Ok(decode_snapshot(row)))?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row??);
        }
        Ok(snapshots)
    }
}

pub(crate) fn load_in(
    conn: &Connection,
    position_key: &str,
) -> Result<Option<PositionSnapshot>, StoreError> {
    conn.query_row(
        "SELECT * FROM snapshot_store WHERE position_key = ?1",
        params![position_key],
        |row| Ok(decode_snapshot(row)),
    )
    .optional()?
    .transpose()
}

pub(crate) fn save_in(
    conn: &Connection,
    snapshot: &PositionSnapshot,
    expected_version: u64,
) -> Result<u64, StoreError> {
    let new_version = expected_version + 1;
    let lots = serde_json::to_string(&snapshot.lots)?;
    let schedule = serde_json::to_string(&snapshot.schedule)?;
    let summary = serde_json::to_string(&snapshot.summary_metrics)?;

    if expected_version == 0 {
        conn.execute(
            "INSERT INTO snapshot_store (
                position_key, account, instrument, currency, direction,
                contract_id, status, reconciliation_status, provisional_trade_id,
                last_ver, last_effective_date, compressed_lots, schedule,
                summary_metrics, total_qty, realized_pnl, last_updated_at, version
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                snapshot.position_key,
                snapshot.account,
                snapshot.instrument,
                snapshot.currency,
                snapshot.direction.as_str(),
                snapshot.contract_id,
                snapshot.status.as_str(),
                snapshot.reconciliation_status.as_str(),
                snapshot.provisional_trade_id,
                snapshot.last_ver as i64,
                snapshot.last_effective_date.map(|d| d.to_string()),
                lots,
                schedule,
                summary,
                snapshot.total_qty.to_string(),
                snapshot.realized_pnl.to_string(),
                encode_instant(&snapshot.last_updated_at),
                new_version as i64,
            ],
        )
        .map_err(|e| {
            map_constraint(e, || {
                StoreError::VersionConflict(format!(
                    "snapshot {} already exists",
                    snapshot.position_key
                ))
            })
        })?;
        return Ok(new_version);
    }

    let updated = conn.execute(
        "UPDATE snapshot_store SET
            account = ?2, instrument = ?3, currency = ?4, direction = ?5,
            contract_id = ?6, status = ?7, reconciliation_status = ?8,
            provisional_trade_id = ?9, last_ver = ?10, last_effective_date = ?11,
            compressed_lots = ?12, schedule = ?13, summary_metrics = ?14,
            total_qty = ?15, realized_pnl = ?16, last_updated_at = ?17,
            version = ?18
         WHERE position_key = ?1 AND version = ?19",
        params![
            snapshot.position_key,
            snapshot.account,
            snapshot.instrument,
            snapshot.currency,
            snapshot.direction.as_str(),
            snapshot.contract_id,
            snapshot.status.as_str(),
            snapshot.reconciliation_status.as_str(),
            snapshot.provisional_trade_id,
            snapshot.last_ver as i64,
            snapshot.last_effective_date.map(|d| d.to_string()),
            lots,
            schedule,
            summary,
            snapshot.total_qty.to_string(),
            snapshot.realized_pnl.to_string(),
            encode_instant(&snapshot.last_updated_at),
            new_version as i64,
            expected_version as i64,
        ],
    )?;

    if updated == 0 {
        return Err(StoreError::VersionConflict(format!(
            "snapshot {} moved past version {}",
            snapshot.position_key, expected_version
        )));
    }
    Ok(new_version)
}

fn decode_snapshot(row: &Row<'_>) -> Result<PositionSnapshot, StoreError> {
    let position_key: String = row.get("position_key")?;
    let corrupt = |field: &str, detail: String| {
        StoreError::Corrupt(format!("snapshot {}: bad {}: {}", position_key, field, detail))
    };

    let direction_raw: String = row.get("direction")?;
    let direction = match direction_raw.as_str() {
        "LONG" => Direction::Long,
        "SHORT" => Direction::Short,
        other => return Err(corrupt("direction", other.to_string())),
    };

    let status_raw: String = row.get("status")?;
    let status = PositionStatus::parse(&status_raw)
        .ok_or_else(|| corrupt("status", status_raw.clone()))?;

    let recon_raw: String = row.get("reconciliation_status")?;
    let reconciliation_status = ReconciliationStatus::parse(&recon_raw)
        .ok_or_else(|| corrupt("reconciliation_status", recon_raw.clone()))?;

    let last_effective_date = row
        .get::<_, Option<String>>("last_effective_date")?
        .map(|raw| raw.parse::<NaiveDate>())
        .transpose()
        .map_err(|e| corrupt("last_effective_date", e.to_string()))?;

    let lots_raw: String = row.get("compressed_lots")?;
    let lots: CompressedLots =
        serde_json::from_str(&lots_raw).map_err(|e| corrupt("compressed_lots", e.to_string()))?;

    let schedule_raw: String = row.get("schedule")?;
    let schedule: Vec<SchedulePoint> =
        serde_json::from_str(&schedule_raw).map_err(|e| corrupt("schedule", e.to_string()))?;

    let summary_raw: String = row.get("summary_metrics")?;
    let summary_metrics = serde_json::from_str(&summary_raw)
        .map_err(|e| corrupt("summary_metrics", e.to_string()))?;

    let total_raw: String = row.get("total_qty")?;
    let total_qty =
        Decimal::from_str(&total_raw).map_err(|e| corrupt("total_qty", e.to_string()))?;

    let pnl_raw: String = row.get("realized_pnl")?;
    let realized_pnl =
        Decimal::from_str(&pnl_raw).map_err(|e| corrupt("realized_pnl", e.to_string()))?;

    let updated_raw: String = row.get("last_updated_at")?;
    let last_updated_at =
        decode_instant(&updated_raw).map_err(|e| corrupt("last_updated_at", e.to_string()))?;

    Ok(PositionSnapshot {
        position_key,
        account: row.get("account")?,
        instrument: row.get("instrument")?,
        currency: row.get("currency")?,
        direction,
        contract_id: row.get("contract_id")?,
        status,
        reconciliation_status,
        provisional_trade_id: row.get("provisional_trade_id")?,
        last_ver: row.get::<_, i64>("last_ver")? as u64,
        last_effective_date,
        lots,
        schedule,
        summary_metrics,
        total_qty,
        realized_pnl,
        last_updated_at,
        version: row.get::<_, i64>("version")? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lots::add_lot;
    use crate::store::Database;
    use rust_decimal_macros::dec;

    fn state_with_lot() -> PositionState {
        let mut state = PositionState::new(
            "c".repeat(64),
            "ACC".into(),
            "AAPL".into(),
            "USD".into(),
            Direction::Long,
            Some("CONTRACT-1".into()),
        );
        add_lot(
            &mut state,
            dec!(100),
            dec!(50),
            NaiveDate::from_ymd_opt(2026, 2, 2).unwrap(),
            None,
        );
        state.mark_applied(NaiveDate::from_ymd_opt(2026, 2, 2).unwrap());
        state
    }

    #[test]
    fn save_load_round_trip() {
        let db = Database::in_memory().unwrap();
        let store = db.snapshots();
        let state = state_with_lot();
        let snapshot = PositionSnapshot::from_state(&state, 1, Utc::now());

        let v1 = store.save(&snapshot, 0).unwrap();
        assert_eq!(v1, 1);

        let loaded = store.load(&state.position_key).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.total_qty, dec!(100));
        let restored = loaded.to_state().unwrap();
        assert_eq!(restored.open_lots, state.open_lots);
        assert_eq!(restored.version, 1);
    }

    #[test]
    fn stale_writer_loses() {
        let db = Database::in_memory().unwrap();
        let store = db.snapshots();
        let state = state_with_lot();
        let snapshot = PositionSnapshot::from_state(&state, 1, Utc::now());

        store.save(&snapshot, 0).unwrap();
        store.save(&snapshot, 1).unwrap();
        // A second writer that loaded at version 1 must fail now.
        let err = store.save(&snapshot, 1).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_)));
    }

    #[test]
    fn double_insert_conflicts() {
        let db = Database::in_memory().unwrap();
        let store = db.snapshots();
        let snapshot = PositionSnapshot::from_state(&state_with_lot(), 1, Utc::now());
        store.save(&snapshot, 0).unwrap();
        let err = store.save(&snapshot, 0).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_)));
    }

    #[test]
    fn paged_lookups_by_denormalized_fields() {
        let db = Database::in_memory().unwrap();
        let store = db.snapshots();
        for i in 0..3 {
            let mut state = state_with_lot();
            state.position_key = format!("{:064}", i);
            let snap = PositionSnapshot::from_state(&state, 1, Utc::now());
            store.save(&snap, 0).unwrap();
        }
        assert_eq!(store.find_by_account("ACC", 2, 0).unwrap().len(), 2);
        assert_eq!(store.find_by_account("ACC", 2, 2).unwrap().len(), 1);
        assert_eq!(store.find_by_instrument("AAPL", 10, 0).unwrap().len(), 3);
        assert_eq!(store.find_by_contract("CONTRACT-1", 10, 0).unwrap().len(), 3);
        assert!(store.find_by_account("NOBODY", 10, 0).unwrap().is_empty());
    }
}
