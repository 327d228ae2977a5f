//! Background store maintenance.
//!
//! Three sweeps run on one interval task: idempotency retention purge,
//! age-based event archival flagging, and the stale-PROVISIONAL detector.
//! All are safe to run concurrently with trade processing — they only
//! touch aged rows or emit break records.

use crate::store::{Database, ReconciliationBreak, StoreError};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct StoreSweeper {
    db: Database,
    idempotency_retention: Duration,
    archival_age: Duration,
    provisional_stale_after: Duration,
    partitions_count: u32,
}

impl StoreSweeper {
    pub fn new(
        db: Database,
        idempotency_retention: Duration,
        archival_age: Duration,
        provisional_stale_after: Duration,
        partitions_count: u32,
    ) -> Self {
        Self {
            db,
            idempotency_retention,
            archival_age,
            provisional_stale_after,
            partitions_count,
        }
    }

    /// One full maintenance pass. Individual sweep failures are logged and
    /// do not abort the others.
    pub fn run_once(&self) {
        if let Err(e) = self.purge_idempotency() {
            warn!(error = %e, "idempotency retention sweep failed");
        }
        if let Err(e) = self.flag_archival() {
            warn!(error = %e, "archival sweep failed");
        }
        if let Err(e) = self.detect_stale_provisional() {
            warn!(error = %e, "stale-provisional sweep failed");
        }
    }

    /// Periodic driver; runs until the task is aborted.
    pub async fn run(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.run_once();
        }
    }

    fn purge_idempotency(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.idempotency_retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let purged = self.db.idempotency().purge_older_than(cutoff)?;
        if purged > 0 {
            info!(purged, "purged aged idempotency records");
        }
        Ok(())
    }

    fn flag_archival(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.archival_age)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        let events = self.db.events();
        let mut flipped = 0usize;
        for partition in 0..self.partitions_count {
            flipped += events.mark_partition_archived(partition, cutoff)?;
        }
        if flipped > 0 {
            info!(flipped, "flagged aged events for archival");
        } else {
            debug!("archival sweep found nothing to flag");
        }
        Ok(())
    }

    fn detect_stale_provisional(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.provisional_stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let stale = self.db.snapshots().find_stale_provisional(cutoff)?;
        for snapshot in stale {
            warn!(
                position_key = %snapshot.position_key,
                provisional_trade_id = ?snapshot.provisional_trade_id,
                since = %snapshot.last_updated_at,
                "snapshot stuck in PROVISIONAL; needs re-drive"
            );
            self.db.lifecycle().record_break(&ReconciliationBreak::new(
                &snapshot.position_key,
                "STALE_PROVISIONAL",
                format!(
                    "provisional since {} (trade {})",
                    snapshot.last_updated_at,
                    snapshot.provisional_trade_id.as_deref().unwrap_or("?")
                ),
            ))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{PositionState, ReconciliationStatus};
    use crate::models::Direction;
    use crate::store::PositionSnapshot;

    fn sweeper(db: &Database) -> StoreSweeper {
        StoreSweeper::new(
            db.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(60),
            4,
        )
    }

    #[test]
    fn stale_provisional_emits_break_rows() {
        let db = Database::in_memory().unwrap();
        let key = "f".repeat(64);
        let mut state = PositionState::new(
            key.clone(),
            "ACC".into(),
            "AAPL".into(),
            "USD".into(),
            Direction::Long,
            None,
        );
        state.reconciliation_status = ReconciliationStatus::Provisional;
        state.provisional_trade_id = Some("T-stuck".into());
        let mut snapshot = PositionSnapshot::from_state(&state, 1, Utc::now());
        snapshot.last_updated_at = Utc::now() - chrono::Duration::hours(2);
        db.snapshots().save(&snapshot, 0).unwrap();

        sweeper(&db).run_once();

        let breaks = db.lifecycle().open_breaks(&key).unwrap();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].break_type, "STALE_PROVISIONAL");
    }

    #[test]
    fn run_once_tolerates_empty_database() {
        let db = Database::in_memory().unwrap();
        sweeper(&db).run_once();
    }
}
