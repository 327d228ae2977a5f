//! SQLite persistence layer.
//!
//! One connection, WAL mode, shared across the stores via
//! `Arc<parking_lot::Mutex<Connection>>`. The event append, snapshot save
//! and idempotency record for a single trade commit in ONE transaction —
//! `Database::with_transaction` is the only way the processors touch the
//! triad.

pub mod event_store;
pub mod idempotency_store;
pub mod lifecycle;
pub mod snapshot_store;
pub mod sweeps;

pub use event_store::EventStore;
pub use idempotency_store::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
pub use lifecycle::{
    LifecycleEvent, LifecycleStore, ReconciliationBreak, RegulatorySubmission, UpiHistoryRow,
};
pub use snapshot_store::{PositionSnapshot, SnapshotStore};
pub use sweeps::StoreSweeper;

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Schema version for migrations.
/// Version history:
/// - v1: initial schema (event/snapshot/idempotency triad + audit tables)
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    /// Optimistic-lock clash or primary-key collision on append.
    VersionConflict(String),
    NotFound(String),
    /// A stored row failed to decode.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "serialization error: {}", e),
            Self::VersionConflict(m) => write!(f, "version conflict: {}", m),
            Self::NotFound(m) => write!(f, "not found: {}", m),
            Self::Corrupt(m) => write!(f, "corrupt row: {}", m),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

/// Owner of the shared connection; hands out store views.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    /// In-memory database (tests).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn events(&self) -> EventStore {
        EventStore::new(self.conn.clone())
    }

    pub fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(self.conn.clone())
    }

    pub fn idempotency(&self) -> IdempotencyStore {
        IdempotencyStore::new(self.conn.clone())
    }

    pub fn lifecycle(&self) -> LifecycleStore {
        LifecycleStore::new(self.conn.clone())
    }

    /// Run `f` inside a single SQLite transaction. Store modules expose
    /// `*_in(conn, ..)` helpers for composing writes in here.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
        "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: Option<u32> = {
            use rusqlite::OptionalExtension;
            conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
        };

        match current_version {
            None => {
                create_schema_v1(&conn)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("created position store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("position store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "position store schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }

        Ok(())
    }
}

fn create_schema_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        -- Append-only event log. (position_key, event_ver) is the PK;
        -- archival_flag supports age-based tiering, never deletion.
        CREATE TABLE IF NOT EXISTS event_store (
            position_key TEXT NOT NULL,
            event_ver INTEGER NOT NULL,
            partition_no INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            effective_date TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            meta_lots TEXT,
            correlation_id TEXT,
            causation_id TEXT,
            contract_id TEXT,
            user_id TEXT,
            archival_flag INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (position_key, event_ver)
        ) WITHOUT ROWID;

        -- Replay order is (effective_date, occurred_at, event_ver).
        CREATE INDEX IF NOT EXISTS idx_event_store_replay
            ON event_store(position_key, effective_date, occurred_at, event_ver);

        CREATE INDEX IF NOT EXISTS idx_event_store_correlation
            ON event_store(correlation_id);

        CREATE INDEX IF NOT EXISTS idx_event_store_partition
            ON event_store(partition_no, occurred_at);

        -- One row per position, overwritten on every applied event.
        CREATE TABLE IF NOT EXISTS snapshot_store (
            position_key TEXT PRIMARY KEY,
            account TEXT NOT NULL,
            instrument TEXT NOT NULL,
            currency TEXT NOT NULL,
            direction TEXT NOT NULL,
            contract_id TEXT,
            status TEXT NOT NULL,
            reconciliation_status TEXT NOT NULL,
            provisional_trade_id TEXT,
            last_ver INTEGER NOT NULL,
            last_effective_date TEXT,
            compressed_lots TEXT NOT NULL,
            schedule TEXT NOT NULL,
            summary_metrics TEXT NOT NULL,
            total_qty TEXT NOT NULL,
            realized_pnl TEXT NOT NULL,
            last_updated_at TEXT NOT NULL,
            version INTEGER NOT NULL
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_snapshot_account
            ON snapshot_store(account, instrument);
        CREATE INDEX IF NOT EXISTS idx_snapshot_instrument
            ON snapshot_store(instrument);
        CREATE INDEX IF NOT EXISTS idx_snapshot_contract
            ON snapshot_store(contract_id);
        CREATE INDEX IF NOT EXISTS idx_snapshot_recon
            ON snapshot_store(reconciliation_status, last_updated_at);

        -- trade_id -> outcome; deduplication and outcome recall.
        CREATE TABLE IF NOT EXISTS idempotency_store (
            trade_id TEXT PRIMARY KEY,
            position_key TEXT NOT NULL,
            event_ver INTEGER NOT NULL,
            status TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_idempotency_recorded
            ON idempotency_store(recorded_at);

        -- Lifecycle audit: CREATED / TERMINATED / REOPENED / CORRECTED.
        CREATE TABLE IF NOT EXISTS upi_history (
            history_id TEXT PRIMARY KEY,
            position_key TEXT NOT NULL,
            lifecycle_event TEXT NOT NULL,
            event_ver INTEGER NOT NULL,
            occurred_at TEXT NOT NULL,
            details TEXT
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_upi_position
            ON upi_history(position_key, occurred_at);

        -- Out-of-band discrepancies surfaced by reconciliation tooling.
        CREATE TABLE IF NOT EXISTS reconciliation_breaks (
            break_id TEXT PRIMARY KEY,
            position_key TEXT NOT NULL,
            break_type TEXT NOT NULL,
            detail TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0
        ) WITHOUT ROWID;

        -- Submission tracking only; content generation lives elsewhere.
        CREATE TABLE IF NOT EXISTS regulatory_submissions (
            submission_id TEXT PRIMARY KEY,
            position_key TEXT NOT NULL,
            regime TEXT NOT NULL,
            status TEXT NOT NULL,
            submitted_at TEXT,
            created_at TEXT NOT NULL
        ) WITHOUT ROWID;
    "#,
    )?;
    Ok(())
}

/// Map a unique/PK constraint failure onto `conflict`, passing other
/// errors through.
pub(crate) fn map_constraint(e: rusqlite::Error, conflict: impl FnOnce() -> StoreError) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            conflict()
        }
        _ => StoreError::Sqlite(e),
    }
}
