//! Trade-id deduplication and outcome recall.
//!
//! `trade_id` is the idempotency key: the first writer wins, and every
//! later submission of the same id reads the recorded outcome instead of
//! reprocessing. A retention sweep purges aged rows.

use crate::store::event_store::{decode_instant, encode_instant};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Processed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &str {
        match self {
            IdempotencyStatus::Processed => "PROCESSED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSED" => Some(IdempotencyStatus::Processed),
            "FAILED" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub trade_id: String,
    pub position_key: String,
    pub event_ver: u64,
    pub status: IdempotencyStatus,
    pub recorded_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processed(trade_id: &str, position_key: &str, event_ver: u64) -> Self {
        Self {
            trade_id: trade_id.to_string(),
            position_key: position_key.to_string(),
            event_ver,
            status: IdempotencyStatus::Processed,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(trade_id: &str, position_key: &str) -> Self {
        Self {
            trade_id: trade_id.to_string(),
            position_key: position_key.to_string(),
            event_ver: 0,
            status: IdempotencyStatus::Failed,
            recorded_at: Utc::now(),
        }
    }
}

pub struct IdempotencyStore {
    conn: Arc<Mutex<Connection>>,
}

impl IdempotencyStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Membership check with outcome recall.
    pub fn check(&self, trade_id: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        check_in(&self.conn.lock(), trade_id)
    }

    /// Record an outcome. Returns false if the trade_id was already
    /// recorded (the earlier record stands).
    pub fn record(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        record_in(&self.conn.lock(), record)
    }

    /// Drop records recorded before `cutoff`. Returns the purge count.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let purged = conn.execute(
            "DELETE FROM idempotency_store WHERE recorded_at < ?1",
            params![encode_instant(&cutoff)],
        )?;
        Ok(purged)
    }
}

pub(crate) fn check_in(
    conn: &Connection,
    trade_id: &str,
) -> Result<Option<IdempotencyRecord>, StoreError> {
    conn.query_row(
        "SELECT trade_id, position_key, event_ver, status, recorded_at
         FROM idempotency_store WHERE trade_id = ?1",
        params![trade_id],
        |row| {
            let status_raw: String = row.get(3)?;
            let recorded_raw: String = row.get(4)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                status_raw,
                recorded_raw,
            ))
        },
    )
    .optional()?
    .map(|(trade_id, position_key, event_ver, status_raw, recorded_raw)| {
        let status = IdempotencyStatus::parse(&status_raw).ok_or_else(|| {
            StoreError::Corrupt(format!("idempotency {}: bad status {}", trade_id, status_raw))
        })?;
        let recorded_at = decode_instant(&recorded_raw).map_err(|e| {
            StoreError::Corrupt(format!("idempotency {}: bad recorded_at: {}", trade_id, e))
        })?;
        Ok(IdempotencyRecord {
            trade_id,
            position_key,
            event_ver: event_ver as u64,
            status,
            recorded_at,
        })
    })
    .transpose()
}

pub(crate) fn record_in(conn: &Connection, record: &IdempotencyRecord) -> Result<bool, StoreError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO idempotency_store
            (trade_id, position_key, event_ver, status, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.trade_id,
            record.position_key,
            record.event_ver as i64,
            record.status.as_str(),
            encode_instant(&record.recorded_at),
        ],
    )?;
    Ok(inserted == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[test]
    fn first_writer_wins() {
        let db = Database::in_memory().unwrap();
        let store = db.idempotency();
        let key = "d".repeat(64);

        assert!(store.check("T1").unwrap().is_none());
        assert!(store
            .record(&IdempotencyRecord::processed("T1", &key, 1))
            .unwrap());
        // Second record for the same trade id is a no-op.
        assert!(!store
            .record(&IdempotencyRecord::processed("T1", &key, 9))
            .unwrap());

        let recalled = store.check("T1").unwrap().unwrap();
        assert_eq!(recalled.event_ver, 1);
        assert_eq!(recalled.status, IdempotencyStatus::Processed);
    }

    #[test]
    fn retention_purge_drops_aged_rows() {
        let db = Database::in_memory().unwrap();
        let store = db.idempotency();
        let key = "d".repeat(64);
        let mut old = IdempotencyRecord::processed("T-old", &key, 1);
        old.recorded_at = Utc::now() - chrono::Duration::days(30);
        store.record(&old).unwrap();
        store
            .record(&IdempotencyRecord::processed("T-new", &key, 2))
            .unwrap();

        let purged = store
            .purge_older_than(Utc::now() - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.check("T-old").unwrap().is_none());
        assert!(store.check("T-new").unwrap().is_some());
    }
}
