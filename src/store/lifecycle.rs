//! Auxiliary audit tables: UPI lifecycle history, reconciliation breaks,
//! and regulatory submission tracking.

use crate::store::event_store::{decode_instant, encode_instant};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;
use uuid::Uuid;

/// Position lifecycle milestones recorded for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEvent {
    Created,
    Terminated,
    Reopened,
    Corrected,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &str {
        match self {
            LifecycleEvent::Created => "CREATED",
            LifecycleEvent::Terminated => "TERMINATED",
            LifecycleEvent::Reopened => "REOPENED",
            LifecycleEvent::Corrected => "CORRECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(LifecycleEvent::Created),
            "TERMINATED" => Some(LifecycleEvent::Terminated),
            "REOPENED" => Some(LifecycleEvent::Reopened),
            "CORRECTED" => Some(LifecycleEvent::Corrected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpiHistoryRow {
    pub history_id: String,
    pub position_key: String,
    pub lifecycle_event: LifecycleEvent,
    pub event_ver: u64,
    pub occurred_at: DateTime<Utc>,
    pub details: Option<String>,
}

/// An out-of-band discrepancy; populated by the coldpath and by
/// reconciliation tooling.
#[derive(Debug, Clone)]
pub struct ReconciliationBreak {
    pub break_id: String,
    pub position_key: String,
    pub break_type: String,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

impl ReconciliationBreak {
    pub fn new(position_key: &str, break_type: &str, detail: String) -> Self {
        Self {
            break_id: Uuid::new_v4().to_string(),
            position_key: position_key.to_string(),
            break_type: break_type.to_string(),
            detail,
            detected_at: Utc::now(),
            resolved: false,
        }
    }
}

/// Submission tracking only — no report content is generated here.
#[derive(Debug, Clone)]
pub struct RegulatorySubmission {
    pub submission_id: String,
    pub position_key: String,
    pub regime: String,
    pub status: String,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub struct LifecycleStore {
    conn: Arc<Mutex<Connection>>,
}

impl LifecycleStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn record_lifecycle(
        &self,
        position_key: &str,
        event: LifecycleEvent,
        event_ver: u64,
        details: Option<String>,
    ) -> Result<String, StoreError> {
        record_lifecycle_in(&self.conn.lock(), position_key, event, event_ver, details)
    }

    pub fn history(&self, position_key: &str) -> Result<Vec<UpiHistoryRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT history_id, position_key, lifecycle_event, event_ver, occurred_at, details
             FROM upi_history WHERE position_key = ?1
             ORDER BY occurred_at, event_ver",
        )?;
        let rows = stmt.query_map(params![position_key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut history = Vec::new();
        for row in rows {
            let (history_id, position_key, event_raw, event_ver, occurred_raw, details) = row?;
            let lifecycle_event = LifecycleEvent::parse(&event_raw).ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "upi_history {}: bad lifecycle_event {}",
                    history_id, event_raw
                ))
            })?;
            let occurred_at = decode_instant(&occurred_raw).map_err(|e| {
                StoreError::Corrupt(format!("upi_history {}: bad occurred_at: {}", history_id, e))
            })?;
            history.push(UpiHistoryRow {
                history_id,
                position_key,
                lifecycle_event,
                event_ver: event_ver as u64,
                occurred_at,
                details,
            });
        }
        Ok(history)
    }

    pub fn record_break(&self, brk: &ReconciliationBreak) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reconciliation_breaks
                (break_id, position_key, break_type, detail, detected_at, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                brk.break_id,
                brk.position_key,
                brk.break_type,
                brk.detail,
                encode_instant(&brk.detected_at),
                brk.resolved as i64,
            ],
        )?;
        Ok(())
    }

    pub fn open_breaks(&self, position_key: &str) -> Result<Vec<ReconciliationBreak>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT break_id, position_key, break_type, detail, detected_at, resolved
             FROM reconciliation_breaks
             WHERE position_key = ?1 AND resolved = 0
             ORDER BY detected_at",
        )?;
        let rows = stmt.query_map(params![position_key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut breaks = Vec::new();
        for row in rows {
            let (break_id, position_key, break_type, detail, detected_raw, resolved) = row?;
            let detected_at = decode_instant(&detected_raw).map_err(|e| {
                StoreError::Corrupt(format!("break {}: bad detected_at: {}", break_id, e))
            })?;
            breaks.push(ReconciliationBreak {
                break_id,
                position_key,
                break_type,
                detail,
                detected_at,
                resolved: resolved != 0,
            });
        }
        Ok(breaks)
    }

    pub fn track_submission(&self, submission: &RegulatorySubmission) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO regulatory_submissions
                (submission_id, position_key, regime, status, submitted_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                submission.submission_id,
                submission.position_key,
                submission.regime,
                submission.status,
                submission.submitted_at.map(|t| encode_instant(&t)),
                encode_instant(&submission.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn update_submission_status(
        &self,
        submission_id: &str,
        status: &str,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE regulatory_submissions SET status = ?2, submitted_at = ?3
             WHERE submission_id = ?1",
            params![
                submission_id,
                status,
                submitted_at.map(|t| encode_instant(&t))
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "submission {}",
                submission_id
            )));
        }
        Ok(())
    }
}

pub(crate) fn record_lifecycle_in(
    conn: &Connection,
    position_key: &str,
    event: LifecycleEvent,
    event_ver: u64,
    details: Option<String>,
) -> Result<String, StoreError> {
    let history_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO upi_history
            (history_id, position_key, lifecycle_event, event_ver, occurred_at, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            history_id,
            position_key,
            event.as_str(),
            event_ver as i64,
            encode_instant(&Utc::now()),
            details,
        ],
    )?;
    Ok(history_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[test]
    fn lifecycle_history_accumulates_in_order() {
        let db = Database::in_memory().unwrap();
        let store = db.lifecycle();
        let key = "e".repeat(64);

        store
            .record_lifecycle(&key, LifecycleEvent::Created, 1, None)
            .unwrap();
        store
            .record_lifecycle(&key, LifecycleEvent::Terminated, 2, None)
            .unwrap();
        store
            .record_lifecycle(&key, LifecycleEvent::Reopened, 3, None)
            .unwrap();

        let history = store.history(&key).unwrap();
        let events: Vec<LifecycleEvent> = history.iter().map(|h| h.lifecycle_event).collect();
        assert_eq!(
            events,
            vec![
                LifecycleEvent::Created,
                LifecycleEvent::Terminated,
                LifecycleEvent::Reopened
            ]
        );
    }

    #[test]
    fn breaks_and_submissions_round_trip() {
        let db = Database::in_memory().unwrap();
        let store = db.lifecycle();
        let key = "e".repeat(64);

        store
            .record_break(&ReconciliationBreak::new(&key, "QTY_MISMATCH", "10 vs 12".into()))
            .unwrap();
        assert_eq!(store.open_breaks(&key).unwrap().len(), 1);

        let submission = RegulatorySubmission {
            submission_id: "S1".into(),
            position_key: key.clone(),
            regime: "SFTR".into(),
            status: "PENDING".into(),
            submitted_at: None,
            created_at: Utc::now(),
        };
        store.track_submission(&submission).unwrap();
        store
            .update_submission_status("S1", "SUBMITTED", Some(Utc::now()))
            .unwrap();
        assert!(matches!(
            store.update_submission_status("S-missing", "SUBMITTED", None),
            Err(StoreError::NotFound(_))
        ));
    }
}
