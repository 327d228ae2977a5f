use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trade event types accepted from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeType {
    NewTrade,
    Increase,
    Decrease,
}

impl TradeType {
    pub fn as_str(&self) -> &str {
        match self {
            TradeType::NewTrade => "NEW_TRADE",
            TradeType::Increase => "INCREASE",
            TradeType::Decrease => "DECREASE",
        }
    }
}

/// Position direction. LONG and SHORT legs of the same
/// (account, instrument, currency) triple are distinct positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// Sign convention: remaining_qty carries this sign on every lot.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

/// Effective-date classification relative to the snapshot and today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatedClass {
    CurrentDated,
    ForwardDated,
    Backdated,
}

impl DatedClass {
    pub fn as_str(&self) -> &str {
        match self {
            DatedClass::CurrentDated => "CURRENT_DATED",
            DatedClass::ForwardDated => "FORWARD_DATED",
            DatedClass::Backdated => "BACKDATED",
        }
    }
}

/// Tax-lot consumption order applied on reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxLotMethod {
    #[default]
    Fifo,
    Lifo,
    Hifo,
}

impl TaxLotMethod {
    pub fn as_str(&self) -> &str {
        match self {
            TaxLotMethod::Fifo => "FIFO",
            TaxLotMethod::Lifo => "LIFO",
            TaxLotMethod::Hifo => "HIFO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "FIFO" => Some(TaxLotMethod::Fifo),
            "LIFO" => Some(TaxLotMethod::Lifo),
            "HIFO" => Some(TaxLotMethod::Hifo),
            _ => None,
        }
    }
}

/// Contract-level business rules resolved per contract_id.
/// Substituted with defaults when the lookup misses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRules {
    pub contract_id: String,
    pub tax_lot_method: TaxLotMethod,
    /// Ancillary policy knobs, passed through untouched.
    #[serde(default)]
    pub business_rules: serde_json::Value,
}

impl ContractRules {
    pub fn default_for(contract_id: &str, method: TaxLotMethod) -> Self {
        Self {
            contract_id: contract_id.to_string(),
            tax_lot_method: method,
            business_rules: serde_json::Value::Null,
        }
    }
}

/// An upstream trade event as delivered on the bus.
///
/// Quantity is an unsigned magnitude; the signed delta applied to the
/// position is derived from `trade_type` and `direction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    #[serde(rename = "tradeId")]
    pub trade_id: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub instrument: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub direction: Direction,
    /// Precomputed position key; derived from the triple when absent.
    #[serde(rename = "positionKey", default)]
    pub position_key: Option<String>,
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
    #[serde(rename = "correlationId", default)]
    pub correlation_id: Option<String>,
    #[serde(rename = "causationId", default)]
    pub causation_id: Option<String>,
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
    /// Written back by the classifier before dispatch routing.
    #[serde(rename = "datedClass", default)]
    pub dated_class: Option<DatedClass>,
}

impl Trade {
    /// Signed quantity delta this trade applies to the position.
    /// Acquisitions carry the direction's sign; reductions the opposite.
    pub fn signed_delta(&self) -> Decimal {
        let magnitude = self.quantity.abs();
        match self.trade_type {
            TradeType::NewTrade | TradeType::Increase => self.direction.sign() * magnitude,
            TradeType::Decrease => -self.direction.sign() * magnitude,
        }
    }

    pub fn with_dated_class(mut self, class: DatedClass) -> Self {
        self.dated_class = Some(class);
        self
    }

    pub fn with_position_key(mut self, key: String) -> Self {
        self.position_key = Some(key);
        self
    }
}

/// A trade that failed validation or terminal processing, as published
/// to the DLQ topic. The reason list is preserved verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub trade: Trade,
    pub errors: Vec<String>,
    #[serde(rename = "errorType")]
    pub error_type: String,
    #[serde(rename = "failedAt")]
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(trade: Trade, errors: Vec<String>, error_type: &str) -> Self {
        Self {
            trade,
            errors,
            error_type: error_type.to_string(),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(trade_type: TradeType, direction: Direction, qty: Decimal) -> Trade {
        Trade {
            trade_id: "T1".into(),
            account: "ACC".into(),
            instrument: "AAPL".into(),
            currency: "USD".into(),
            direction,
            position_key: None,
            trade_type,
            quantity: qty,
            price: dec!(50),
            effective_date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            settlement_date: None,
            contract_id: None,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            dated_class: None,
        }
    }

    #[test]
    fn signed_delta_follows_direction() {
        assert_eq!(
            trade(TradeType::NewTrade, Direction::Long, dec!(100)).signed_delta(),
            dec!(100)
        );
        assert_eq!(
            trade(TradeType::Decrease, Direction::Long, dec!(40)).signed_delta(),
            dec!(-40)
        );
        assert_eq!(
            trade(TradeType::NewTrade, Direction::Short, dec!(100)).signed_delta(),
            dec!(-100)
        );
        assert_eq!(
            trade(TradeType::Decrease, Direction::Short, dec!(40)).signed_delta(),
            dec!(40)
        );
    }

    #[test]
    fn trade_json_round_trip_ignores_unknown_fields() {
        let raw = r#"{
            "tradeId": "T9",
            "account": "acc",
            "instrument": "ibm",
            "currency": "usd",
            "tradeType": "NEW_TRADE",
            "quantity": "100",
            "price": "50.25",
            "effectiveDate": "2026-01-15",
            "somethingUpstreamAdded": {"x": 1}
        }"#;
        let t: Trade = serde_json::from_str(raw).unwrap();
        assert_eq!(t.trade_id, "T9");
        assert_eq!(t.quantity, dec!(100));
        assert_eq!(t.price, dec!(50.25));
        assert_eq!(t.direction, Direction::Long);
    }
}
