//! Position lifecycle state machine.
//!
//! States: NON_EXISTENT, ACTIVE, TERMINATED. Only NEW_TRADE / INCREASE /
//! DECREASE drive transitions; RESET, CORRECTION and the coldpath marker
//! events are internal and never reach this machine.

use crate::engine::error::EngineError;
use crate::models::TradeType;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NonExistent,
    Active,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &str {
        match self {
            LifecycleState::NonExistent => "NON_EXISTENT",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Terminated => "TERMINATED",
        }
    }
}

/// Outcome of a permitted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub new_state: LifecycleState,
    pub state_changed: bool,
}

/// Validate and label the transition `(current, trade_type)` given the
/// quantity the position would hold after applying the trade.
///
/// Rejections carry a human-readable reason that is preserved end-to-end
/// into the DLQ message.
pub fn transition(
    current: LifecycleState,
    trade_type: TradeType,
    quantity_after: Decimal,
) -> Result<Transition, EngineError> {
    use LifecycleState::*;
    use TradeType::*;

    match (current, trade_type) {
        (NonExistent, NewTrade) => Ok(Transition {
            new_state: Active,
            state_changed: true,
        }),
        (NonExistent, Increase) | (NonExistent, Decrease) => Err(EngineError::StateViolation(
            format!(
                "{} rejected: position does not exist; open it with NEW_TRADE",
                trade_type.as_str()
            ),
        )),
        (Active, NewTrade) => Err(EngineError::StateViolation(
            "NEW_TRADE rejected: position is already ACTIVE; use INCREASE/DECREASE".to_string(),
        )),
        (Active, Increase) => Ok(Transition {
            new_state: Active,
            state_changed: false,
        }),
        (Active, Decrease) => {
            if quantity_after.is_zero() {
                Ok(Transition {
                    new_state: Terminated,
                    state_changed: true,
                })
            } else {
                Ok(Transition {
                    new_state: Active,
                    state_changed: false,
                })
            }
        }
        (Terminated, NewTrade) => Ok(Transition {
            new_state: Active,
            state_changed: true,
        }),
        (Terminated, Increase) | (Terminated, Decrease) => Err(EngineError::StateViolation(
            format!(
                "{} rejected: position is TERMINATED; reopen it with NEW_TRADE",
                trade_type.as_str()
            ),
        )),
    }
}
