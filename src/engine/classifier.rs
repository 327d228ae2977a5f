//! Effective-date classification.
//!
//! Every trade is labeled before routing: forward- and current-dated trades
//! take the hotpath, backdated trades detour through the coldpath replay.
//! "Today" is resolved in the engine's configured zone, not the host zone.

use crate::models::DatedClass;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct Classifier {
    tz: Tz,
}

impl Classifier {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }

    /// Classify against the snapshot's latest applied effective date
    /// (`None` when the position has no snapshot yet).
    pub fn classify(
        &self,
        effective_date: NaiveDate,
        snapshot_latest: Option<NaiveDate>,
    ) -> DatedClass {
        classify_with_today(effective_date, snapshot_latest, self.today())
    }
}

/// Core rule, separated from the wall clock:
/// after today ⇒ FORWARD_DATED; no snapshot or on/after the snapshot's
/// latest effective date ⇒ CURRENT_DATED; otherwise BACKDATED.
pub fn classify_with_today(
    effective_date: NaiveDate,
    snapshot_latest: Option<NaiveDate>,
    today: NaiveDate,
) -> DatedClass {
    if effective_date > today {
        return DatedClass::ForwardDated;
    }
    match snapshot_latest {
        None => DatedClass::CurrentDated,
        Some(latest) if effective_date >= latest => DatedClass::CurrentDated,
        Some(_) => DatedClass::Backdated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn no_snapshot_is_current_dated() {
        let today = d(2026, 6, 15);
        assert_eq!(
            classify_with_today(d(2026, 6, 10), None, today),
            DatedClass::CurrentDated
        );
    }

    #[test]
    fn after_today_is_forward_even_past_snapshot_latest() {
        let today = d(2026, 6, 15);
        assert_eq!(
            classify_with_today(d(2026, 6, 16), Some(d(2026, 6, 10)), today),
            DatedClass::ForwardDated
        );
    }

    #[test]
    fn equal_to_snapshot_latest_is_current_dated() {
        let today = d(2026, 6, 15);
        assert_eq!(
            classify_with_today(d(2026, 6, 10), Some(d(2026, 6, 10)), today),
            DatedClass::CurrentDated
        );
    }

    #[test]
    fn before_snapshot_latest_is_backdated() {
        let today = d(2026, 6, 15);
        assert_eq!(
            classify_with_today(d(2026, 6, 5), Some(d(2026, 6, 10)), today),
            DatedClass::Backdated
        );
    }
}
