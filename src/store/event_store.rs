//! Append-only event log.
//!
//! Rows are never updated or deleted; the single exception is the archival
//! sweep flipping `archival_flag` on aged partitions. Version collisions on
//! append surface as `VersionConflict`, which callers treat as a concurrent
//! writer (a bug under the per-key worker design, but surfaced rather than
//! silently absorbed).

use crate::engine::events::{EventType, PositionEvent};
use crate::engine::lots::LotAllocation;
use crate::store::{map_constraint, StoreError};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::sync::Arc;

pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Next dense version for the key: `max(event_ver) + 1` over
    /// non-archived events, or 1 for a fresh key.
    pub fn next_version(&self, position_key: &str) -> Result<u64, StoreError> {
        next_version_in(&self.conn.lock(), position_key)
    }

    /// Atomic append; `(position_key, event_ver)` collisions fail with
    /// `VersionConflict`.
    pub fn append(&self, event: &PositionEvent) -> Result<(), StoreError> {
        append_in(&self.conn.lock(), event)
    }

    /// All non-archived events for the key in canonical replay order.
    pub fn list(&self, position_key: &str) -> Result<Vec<PositionEvent>, StoreError> {
        query_events(
            &self.conn.lock(),
            "SELECT * FROM event_store
             WHERE position_key = ?1 AND archival_flag = 0
             ORDER BY effective_date, occurred_at, event_ver",
            params![position_key],
        )
    }

    /// Canonical-order events with `effective_date <= as_of`.
    pub fn list_as_of(
        &self,
        position_key: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<PositionEvent>, StoreError> {
        query_events(
            &self.conn.lock(),
            "SELECT * FROM event_store
             WHERE position_key = ?1 AND archival_flag = 0 AND effective_date <= ?2
             ORDER BY effective_date, occurred_at, event_ver",
            params![position_key, as_of.to_string()],
        )
    }

    /// Version range `[from_ver, to_ver]` in storage order.
    pub fn range(
        &self,
        position_key: &str,
        from_ver: u64,
        to_ver: u64,
    ) -> Result<Vec<PositionEvent>, StoreError> {
        query_events(
            &self.conn.lock(),
            "SELECT * FROM event_store
             WHERE position_key = ?1 AND event_ver BETWEEN ?2 AND ?3
             ORDER BY event_ver",
            params![position_key, from_ver as i64, to_ver as i64],
        )
    }

    pub fn find_by_correlation(&self, correlation_id: &str) -> Result<Vec<PositionEvent>, StoreError> {
        query_events(
            &self.conn.lock(),
            "SELECT * FROM event_store
             WHERE correlation_id = ?1
             ORDER BY position_key, event_ver",
            params![correlation_id],
        )
    }

    /// Flag aged events of one partition for archival. Returns the number
    /// of rows flipped.
    pub fn mark_partition_archived(
        &self,
        partition_no: u32,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let flipped = conn.execute(
            "UPDATE event_store SET archival_flag = 1
             WHERE partition_no = ?1 AND archival_flag = 0 AND occurred_at < ?2",
            params![partition_no, encode_instant(&cutoff)],
        )?;
        Ok(flipped)
    }
}

pub(crate) fn next_version_in(conn: &Connection, position_key: &str) -> Result<u64, StoreError> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(event_ver), 0) FROM event_store
         WHERE position_key = ?1 AND archival_flag = 0",
        params![position_key],
        |row| row.get(0),
    )?;
    Ok(max as u64 + 1)
}

pub(crate) fn append_in(conn: &Connection, event: &PositionEvent) -> Result<(), StoreError> {
    let meta_lots = event
        .meta_lots
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO event_store (
            position_key, event_ver, partition_no, event_type, effective_date,
            occurred_at, payload, meta_lots, correlation_id, causation_id,
            contract_id, user_id, archival_flag
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            event.position_key,
            event.event_ver as i64,
            event.partition_no,
            event.event_type.as_str(),
            event.effective_date.to_string(),
            encode_instant(&event.occurred_at),
            serde_json::to_string(&event.payload)?,
            meta_lots,
            event.correlation_id,
            event.causation_id,
            event.contract_id,
            event.user_id,
            event.archival_flag as i64,
        ],
    )
    .map_err(|e| {
        map_constraint(e, || {
            StoreError::VersionConflict(format!(
                "event {}@{} already appended",
                event.position_key, event.event_ver
            ))
        })
    })?;
    Ok(())
}

fn query_events(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<PositionEvent>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, decode_row)?;
    let mut events = Vec::new();
    for row in rows {
        events.push(row??);
    }
    Ok(events)
}

type DecodedRow = Result<PositionEvent, StoreError>;

fn decode_row(row: &Row<'_>) -> rusqlite::Result<DecodedRow> {
    Ok(decode_event(row))
}

fn decode_event(row: &Row<'_>) -> Result<PositionEvent, StoreError> {
    let position_key: String = row.get("position_key")?;
    let event_ver: i64 = row.get("event_ver")?;
    let event_type_raw: String = row.get("event_type")?;
    let event_type = EventType::parse(&event_type_raw).ok_or_else(|| {
        StoreError::Corrupt(format!(
            "event {}@{}: unknown event_type {}",
            position_key, event_ver, event_type_raw
        ))
    })?;

    let effective_raw: String = row.get("effective_date")?;
    let effective_date = effective_raw.parse::<NaiveDate>().map_err(|e| {
        StoreError::Corrupt(format!(
            "event {}@{}: bad effective_date: {}",
            position_key, event_ver, e
        ))
    })?;

    let occurred_raw: String = row.get("occurred_at")?;
    let occurred_at = decode_instant(&occurred_raw).map_err(|e| {
        StoreError::Corrupt(format!(
            "event {}@{}: bad occurred_at: {}",
            position_key, event_ver, e
        ))
    })?;

    let payload_raw: String = row.get("payload")?;
    let payload = serde_json::from_str(&payload_raw).map_err(|e| {
        StoreError::Corrupt(format!(
            "event {}@{}: bad payload: {}",
            position_key, event_ver, e
        ))
    })?;

    let meta_lots: Option<LotAllocation> = row
        .get::<_, Option<String>>("meta_lots")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| {
            StoreError::Corrupt(format!(
                "event {}@{}: bad meta_lots: {}",
                position_key, event_ver, e
            ))
        })?;

    Ok(PositionEvent {
        position_key,
        event_ver: event_ver as u64,
        partition_no: row.get("partition_no")?,
        event_type,
        effective_date,
        occurred_at,
        payload,
        meta_lots,
        correlation_id: row.get("correlation_id")?,
        causation_id: row.get("causation_id")?,
        contract_id: row.get("contract_id")?,
        user_id: row.get("user_id")?,
        archival_flag: row.get::<_, i64>("archival_flag")? != 0,
    })
}

/// RFC3339 UTC with fixed microsecond precision so lexicographic order in
/// SQL equals chronological order.
pub(crate) fn encode_instant(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_instant(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Trade, TradeType};
    use crate::store::Database;
    use rust_decimal_macros::dec;

    fn trade(id: &str, effective: NaiveDate) -> Trade {
        Trade {
            trade_id: id.into(),
            account: "ACC".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            direction: Direction::Long,
            position_key: None,
            trade_type: TradeType::Increase,
            quantity: dec!(10),
            price: dec!(50),
            effective_date: effective,
            settlement_date: None,
            contract_id: None,
            correlation_id: Some("corr-1".into()),
            causation_id: None,
            user_id: None,
            dated_class: None,
        }
    }

    fn event(key: &str, ver: u64, effective: NaiveDate) -> PositionEvent {
        PositionEvent::from_trade(
            &trade(&format!("T{}", ver), effective),
            key,
            3,
            ver,
            EventType::Increase,
            None,
        )
        .unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    #[test]
    fn next_version_is_dense_from_one() {
        let db = Database::in_memory().unwrap();
        let store = db.events();
        let key = "a".repeat(64);
        assert_eq!(store.next_version(&key).unwrap(), 1);
        store.append(&event(&key, 1, d(1))).unwrap();
        store.append(&event(&key, 2, d(2))).unwrap();
        assert_eq!(store.next_version(&key).unwrap(), 3);
    }

    #[test]
    fn duplicate_version_is_a_conflict() {
        let db = Database::in_memory().unwrap();
        let store = db.events();
        let key = "a".repeat(64);
        store.append(&event(&key, 1, d(1))).unwrap();
        let err = store.append(&event(&key, 1, d(2))).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_)));
    }

    #[test]
    fn list_returns_canonical_replay_order() {
        let db = Database::in_memory().unwrap();
        let store = db.events();
        let key = "a".repeat(64);
        // Appended out of effective-date order, as the coldpath does.
        store.append(&event(&key, 1, d(10))).unwrap();
        store.append(&event(&key, 2, d(12))).unwrap();
        store.append(&event(&key, 3, d(5))).unwrap();

        let listed = store.list(&key).unwrap();
        let dates: Vec<NaiveDate> = listed.iter().map(|e| e.effective_date).collect();
        assert_eq!(dates, vec![d(5), d(10), d(12)]);

        let as_of = store.list_as_of(&key, d(10)).unwrap();
        assert_eq!(as_of.len(), 2);
        assert_eq!(as_of.last().unwrap().effective_date, d(10));
    }

    #[test]
    fn archival_flags_drop_out_of_reads() {
        let db = Database::in_memory().unwrap();
        let store = db.events();
        let key = "a".repeat(64);
        store.append(&event(&key, 1, d(1))).unwrap();
        store.append(&event(&key, 2, d(2))).unwrap();

        let flipped = store
            .mark_partition_archived(3, Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(flipped, 2);
        assert!(store.list(&key).unwrap().is_empty());
        // next_version counts non-archived events only.
        assert_eq!(store.next_version(&key).unwrap(), 1);
    }

    #[test]
    fn find_by_correlation_spans_keys() {
        let db = Database::in_memory().unwrap();
        let store = db.events();
        store.append(&event(&"a".repeat(64), 1, d(1))).unwrap();
        store.append(&event(&"b".repeat(64), 1, d(1))).unwrap();
        let found = store.find_by_correlation("corr-1").unwrap();
        assert_eq!(found.len(), 2);
    }
}
