//! Position event model.
//!
//! Events are immutable once appended. `(position_key, event_ver)` is the
//! primary key; storage order is `event_ver`-ascending, while logical
//! (replay) order is `(effective_date, occurred_at, event_ver)`.

use crate::engine::error::EngineError;
use crate::engine::lots::LotAllocation;
use crate::models::{Direction, Trade, TradeType};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Everything that can land in the event log.
///
/// Only trade-shaped events (and the provisional apply, which wraps one)
/// participate in replay; the rest are audit markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    NewTrade,
    Increase,
    Decrease,
    Reset,
    Correction,
    PositionClosed,
    ProvisionalTradeApplied,
    HistoricalPositionCorrected,
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::NewTrade => "NEW_TRADE",
            EventType::Increase => "INCREASE",
            EventType::Decrease => "DECREASE",
            EventType::Reset => "RESET",
            EventType::Correction => "CORRECTION",
            EventType::PositionClosed => "POSITION_CLOSED",
            EventType::ProvisionalTradeApplied => "PROVISIONAL_TRADE_APPLIED",
            EventType::HistoricalPositionCorrected => "HISTORICAL_POSITION_CORRECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW_TRADE" => Some(EventType::NewTrade),
            "INCREASE" => Some(EventType::Increase),
            "DECREASE" => Some(EventType::Decrease),
            "RESET" => Some(EventType::Reset),
            "CORRECTION" => Some(EventType::Correction),
            "POSITION_CLOSED" => Some(EventType::PositionClosed),
            "PROVISIONAL_TRADE_APPLIED" => Some(EventType::ProvisionalTradeApplied),
            "HISTORICAL_POSITION_CORRECTED" => Some(EventType::HistoricalPositionCorrected),
        _ => None,
        }
    }

    pub fn from_trade_type(t: TradeType) -> Self {
        match t {
            TradeType::NewTrade => EventType::NewTrade,
            TradeType::Increase => EventType::Increase,
            TradeType::Decrease => EventType::Decrease,
        }
    }

    /// Events that mutate lots when history is replayed. The provisional
    /// apply replays as the trade it carries; markers are skipped.
    pub fn is_replayable(&self) -> bool {
        matches!(
            self,
            EventType::NewTrade
                | EventType::Increase
                | EventType::Decrease
                | EventType::Reset
                | EventType::ProvisionalTradeApplied
        )
    }
}

/// Serialized trade fields carried on trade-shaped events.
/// Unknown upstream fields are dropped at this boundary; decimals ride as
/// strings to avoid float drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePayload {
    #[serde(rename = "tradeId")]
    pub trade_id: String,
    pub account: String,
    pub instrument: String,
    pub currency: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(rename = "tradeType")]
    pub trade_type: TradeType,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(rename = "effectiveDate")]
    pub effective_date: NaiveDate,
    #[serde(rename = "settlementDate", default)]
    pub settlement_date: Option<NaiveDate>,
    #[serde(rename = "contractId", default)]
    pub contract_id: Option<String>,
}

impl From<&Trade> for TradePayload {
    fn from(t: &Trade) -> Self {
        Self {
            trade_id: t.trade_id.clone(),
            account: t.account.clone(),
            instrument: t.instrument.clone(),
            currency: t.currency.clone(),
            direction: t.direction,
            trade_type: t.trade_type,
            quantity: t.quantity,
            price: t.price,
            effective_date: t.effective_date,
            settlement_date: t.settlement_date,
            contract_id: t.contract_id.clone(),
        }
    }
}

impl TradePayload {
    /// Signed delta this payload applies on replay; mirrors
    /// `Trade::signed_delta`.
    pub fn signed_delta(&self) -> Decimal {
        let magnitude = self.quantity.abs();
        match self.trade_type {
            TradeType::NewTrade | TradeType::Increase => self.direction.sign() * magnitude,
            TradeType::Decrease => -self.direction.sign() * magnitude,
        }
    }
}

/// Payload of a CORRECTION event: which stored event's effect changed once
/// the backdated trade was inserted ahead of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionPayload {
    #[serde(rename = "correctedEventVer")]
    pub corrected_event_ver: u64,
    #[serde(rename = "backdatedTradeId")]
    pub backdated_trade_id: String,
    /// Allocation the event originally recorded.
    pub previous: Option<LotAllocation>,
    /// Allocation after re-sequenced replay.
    pub recomputed: Option<LotAllocation>,
}

/// Payload of the single HISTORICAL_POSITION_CORRECTED summary emitted per
/// coldpath run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalCorrectionPayload {
    #[serde(rename = "backdatedTradeId")]
    pub backdated_trade_id: String,
    #[serde(rename = "priorTotalQty")]
    pub prior_total_qty: Decimal,
    #[serde(rename = "newTotalQty")]
    pub new_total_qty: Decimal,
    #[serde(rename = "priorRealizedPnl")]
    pub prior_realized_pnl: Decimal,
    #[serde(rename = "newRealizedPnl")]
    pub new_realized_pnl: Decimal,
    #[serde(rename = "lotsAdded")]
    pub lots_added: u64,
    #[serde(rename = "lotsRemoved")]
    pub lots_removed: u64,
    #[serde(rename = "correctedEvents")]
    pub corrected_events: u64,
}

/// An immutable record of an applied trade or lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub position_key: String,
    pub event_ver: u64,
    pub partition_no: u32,
    pub event_type: EventType,
    /// Valid time.
    pub effective_date: NaiveDate,
    /// Transaction time.
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// Audit record of the lot allocations this event produced.
    pub meta_lots: Option<LotAllocation>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub contract_id: Option<String>,
    pub user_id: Option<String>,
    pub archival_flag: bool,
}

impl PositionEvent {
    /// Display id used in logs and corruption reports.
    pub fn event_id(&self) -> String {
        format!("{}@{}", self.position_key, self.event_ver)
    }

    pub fn from_trade(
        trade: &Trade,
        position_key: &str,
        partition_no: u32,
        event_ver: u64,
        event_type: EventType,
        meta_lots: Option<LotAllocation>,
    ) -> Result<Self, EngineError> {
        let payload = serde_json::to_value(TradePayload::from(trade))?;
        Ok(Self {
            position_key: position_key.to_string(),
            event_ver,
            partition_no,
            event_type,
            effective_date: trade.effective_date,
            occurred_at: Utc::now(),
            payload,
            meta_lots,
            correlation_id: trade.correlation_id.clone(),
            causation_id: trade.causation_id.clone(),
            contract_id: trade.contract_id.clone(),
            user_id: trade.user_id.clone(),
            archival_flag: false,
        })
    }

    /// Decode the trade payload; decode failures surface as corruption
    /// tagged with this event's id.
    pub fn trade_payload(&self) -> Result<TradePayload, EngineError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| EngineError::DataCorruption {
            event_id: self.event_id(),
            detail: e.to_string(),
        })
    }
}

/// Canonical replay comparator: `(effective_date, occurred_at, event_ver)`.
pub fn canonical_order(a: &PositionEvent, b: &PositionEvent) -> std::cmp::Ordering {
    a.effective_date
        .cmp(&b.effective_date)
        .then(a.occurred_at.cmp(&b.occurred_at))
        .then(a.event_ver.cmp(&b.event_ver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn event_type_round_trips() {
        for t in [
            EventType::NewTrade,
            EventType::Increase,
            EventType::Decrease,
            EventType::Reset,
            EventType::Correction,
            EventType::PositionClosed,
            EventType::ProvisionalTradeApplied,
            EventType::HistoricalPositionCorrected,
        ] {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EventType::parse("UNKNOWN"), None);
    }

    #[test]
    fn payload_decimals_serialize_as_strings() {
        let payload = TradePayload {
            trade_id: "T1".into(),
            account: "ACC".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            direction: Direction::Long,
            trade_type: TradeType::NewTrade,
            quantity: dec!(100),
            price: dec!(50.10),
            effective_date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            settlement_date: None,
            contract_id: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["quantity"], serde_json::json!("100"));
        assert_eq!(json["price"], serde_json::json!("50.10"));
    }

    #[test]
    fn canonical_order_breaks_ties_by_transaction_time_then_ver() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let t0 = Utc::now();
        let mk = |ver: u64, occurred: DateTime<Utc>| PositionEvent {
            position_key: "k".repeat(64),
            event_ver: ver,
            partition_no: 0,
            event_type: EventType::Increase,
            effective_date: date,
            occurred_at: occurred,
            payload: serde_json::Value::Null,
            meta_lots: None,
            correlation_id: None,
            causation_id: None,
            contract_id: None,
            user_id: None,
            archival_flag: false,
        };
        let a = mk(2, t0);
        let b = mk(1, t0 + chrono::Duration::seconds(1));
        // Same effective date: the earlier transaction time wins even with a
        // later version.
        assert_eq!(canonical_order(&a, &b), std::cmp::Ordering::Less);
    }
}
