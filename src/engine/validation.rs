//! Pre-processing validation gate.
//!
//! Field and range checks plus a state-machine pre-check against the
//! current snapshot. Failures never surface as errors to the bus handler:
//! the dispatcher publishes the trade to the DLQ with the collected reason
//! list and acknowledges.

use crate::engine::state::PositionStatus;
use crate::engine::state_machine::{self, LifecycleState};
use crate::engine::error::EngineError;
use crate::models::{Trade, TradeType};
use crate::store::PositionSnapshot;
use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Upper price bound; anything above is considered fat-fingered upstream.
const MAX_PRICE: i64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub errors: Vec<String>,
    pub error_type: &'static str,
}

/// Run the gate. `snapshot` is the position's current snapshot, if any;
/// `today` comes from the engine's configured zone.
pub fn validate(
    trade: &Trade,
    snapshot: Option<&PositionSnapshot>,
    today: NaiveDate,
) -> Result<(), ValidationFailure> {
    let mut errors = Vec::new();

    if trade.trade_id.trim().is_empty() {
        errors.push("tradeId is required".to_string());
    }

    let has_key = trade
        .position_key
        .as_deref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false);
    if !has_key {
        for (field, value) in [
            ("account", &trade.account),
            ("instrument", &trade.instrument),
            ("currency", &trade.currency),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{} is required when positionKey is absent", field));
            }
        }
    }

    if trade.quantity.is_zero() {
        errors.push("quantity must be non-zero".to_string());
    }

    if trade.price <= Decimal::ZERO {
        errors.push("price must be positive".to_string());
    } else if trade.price > Decimal::from(MAX_PRICE) {
        errors.push(format!("price exceeds maximum of {}", MAX_PRICE));
    }

    let horizon = today + chrono::Duration::days(365);
    if trade.effective_date > horizon {
        errors.push(format!(
            "effectiveDate {} is more than one year ahead",
            trade.effective_date
        ));
    }

    if !errors.is_empty() {
        return Err(ValidationFailure {
            errors,
            error_type: "INVALID_ARGUMENT",
        });
    }

    // Transition pre-check. DECREASE uses a quantity_after placeholder of
    // 1; the real quantity check happens inside the reduction.
    let current = lifecycle_of(snapshot);
    let quantity_after = match trade.trade_type {
        TradeType::Decrease => Decimal::ONE,
        _ => trade.quantity.abs(),
    };
    if let Err(EngineError::StateViolation(reason)) =
        state_machine::transition(current, trade.trade_type, quantity_after)
    {
        return Err(ValidationFailure {
            errors: vec![reason],
            error_type: "STATE_VIOLATION",
        });
    }

    Ok(())
}

/// Lifecycle as the state machine sees it: no snapshot means the position
/// does not exist yet.
pub fn lifecycle_of(snapshot: Option<&PositionSnapshot>) -> LifecycleState {
    match snapshot {
        None => LifecycleState::NonExistent,
        Some(s) => match s.status {
            PositionStatus::Active => LifecycleState::Active,
            PositionStatus::Terminated => LifecycleState::Terminated,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::PositionState;
    use crate::models::Direction;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn base_trade() -> Trade {
        Trade {
            trade_id: "T1".into(),
            account: "ACC".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            direction: Direction::Long,
            position_key: None,
            trade_type: TradeType::NewTrade,
            quantity: dec!(100),
            price: dec!(50),
            effective_date: today(),
            settlement_date: None,
            contract_id: None,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            dated_class: None,
        }
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn active_snapshot() -> PositionSnapshot {
        let state = PositionState::new(
            "a".repeat(64),
            "ACC".into(),
            "AAPL".into(),
            "USD".into(),
            Direction::Long,
            None,
        );
        PositionSnapshot::from_state(&state, 1, Utc::now())
    }

    #[test]
    fn clean_new_trade_passes() {
        assert!(validate(&base_trade(), None, today()).is_ok());
    }

    #[test]
    fn field_errors_accumulate() {
        let mut t = base_trade();
        t.trade_id = " ".into();
        t.account = "".into();
        t.quantity = dec!(0);
        t.price = dec!(0);
        let failure = validate(&t, None, today()).unwrap_err();
        assert_eq!(failure.error_type, "INVALID_ARGUMENT");
        assert_eq!(failure.errors.len(), 4);
    }

    #[test]
    fn short_quantities_are_accepted() {
        let mut t = base_trade();
        t.direction = Direction::Short;
        assert!(validate(&t, None, today()).is_ok());
    }

    #[test]
    fn price_cap_enforced() {
        let mut t = base_trade();
        t.price = dec!(1000001);
        let failure = validate(&t, None, today()).unwrap_err();
        assert!(failure.errors[0].contains("maximum"));
    }

    #[test]
    fn effective_date_beyond_a_year_rejected() {
        let mut t = base_trade();
        t.effective_date = today() + chrono::Duration::days(366);
        assert!(validate(&t, None, today()).is_err());
        t.effective_date = today() + chrono::Duration::days(365);
        assert!(validate(&t, None, today()).is_ok());
    }

    #[test]
    fn new_trade_on_active_is_a_state_violation() {
        let snapshot = active_snapshot();
        let failure = validate(&base_trade(), Some(&snapshot), today()).unwrap_err();
        assert_eq!(failure.error_type, "STATE_VIOLATION");
        assert!(failure.errors[0].contains("INCREASE/DECREASE"));
    }

    #[test]
    fn decrease_uses_placeholder_quantity() {
        let snapshot = active_snapshot();
        let mut t = base_trade();
        t.trade_type = TradeType::Decrease;
        // Even a reduction larger than the open quantity passes the gate;
        // the lot engine decides under-allocation later.
        t.quantity = dec!(1_000_000);
        assert!(validate(&t, Some(&snapshot), today()).is_ok());
    }

    #[test]
    fn explicit_position_key_skips_triple_requirement() {
        let mut t = base_trade();
        t.account = "".into();
        t.instrument = "".into();
        t.currency = "".into();
        t.position_key = Some("b".repeat(64));
        assert!(validate(&t, None, today()).is_ok());
    }
}
