//! Snapshot compression and payload marshalling.
//!
//! Open lots persist as parallel arrays rather than a list of lot objects:
//! one array per field, all equal length. Older snapshots predate the
//! `original_qtys`/`cost_bases`/`settled_quantities` arrays; inflate
//! accepts them by defaulting `cost_basis := current_ref_price` and
//! `original_qty := remaining_qty`.

use crate::engine::error::EngineError;
use crate::engine::lots::TaxLot;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Parallel-array encoding of a position's open lots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressedLots {
    pub ids: Vec<Uuid>,
    #[serde(rename = "tradeDates")]
    pub trade_dates: Vec<NaiveDate>,
    #[serde(rename = "settlementDates", default, skip_serializing_if = "Option::is_none")]
    pub settlement_dates: Option<Vec<Option<NaiveDate>>>,
    #[serde(rename = "remainingQtys")]
    pub remaining_qtys: Vec<Decimal>,
    #[serde(rename = "originalQtys", default, skip_serializing_if = "Option::is_none")]
    pub original_qtys: Option<Vec<Decimal>>,
    #[serde(rename = "costBases", default, skip_serializing_if = "Option::is_none")]
    pub cost_bases: Option<Vec<Decimal>>,
    #[serde(rename = "currentRefPrices")]
    pub current_ref_prices: Vec<Decimal>,
    #[serde(rename = "settledQuantities", default, skip_serializing_if = "Option::is_none")]
    pub settled_quantities: Option<Vec<Option<Decimal>>>,
}

/// Deterministic element-wise compression. Lot order is preserved, so
/// `inflate(compress(lots)) == lots`.
pub fn compress(lots: &[TaxLot]) -> CompressedLots {
    CompressedLots {
        ids: lots.iter().map(|l| l.id).collect(),
        trade_dates: lots.iter().map(|l| l.trade_date).collect(),
        settlement_dates: Some(lots.iter().map(|l| l.settlement_date).collect()),
        remaining_qtys: lots.iter().map(|l| l.remaining_qty).collect(),
        original_qtys: Some(lots.iter().map(|l| l.original_qty).collect()),
        cost_bases: Some(lots.iter().map(|l| l.cost_basis).collect()),
        current_ref_prices: lots.iter().map(|l| l.current_ref_price).collect(),
        settled_quantities: Some(lots.iter().map(|l| l.settled_quantity).collect()),
    }
}

/// Reconstruct lots element-wise. Every present array must agree in length
/// with `ids`; missing optional arrays take the backward-compat defaults.
pub fn inflate(compressed: &CompressedLots) -> Result<Vec<TaxLot>, EngineError> {
    let n = compressed.ids.len();
    check_len("tradeDates", compressed.trade_dates.len(), n)?;
    check_len("remainingQtys", compressed.remaining_qtys.len(), n)?;
    check_len("currentRefPrices", compressed.current_ref_prices.len(), n)?;
    if let Some(v) = &compressed.settlement_dates {
        check_len("settlementDates", v.len(), n)?;
    }
    if let Some(v) = &compressed.original_qtys {
        check_len("originalQtys", v.len(), n)?;
    }
    if let Some(v) = &compressed.cost_bases {
        check_len("costBases", v.len(), n)?;
    }
    if let Some(v) = &compressed.settled_quantities {
        check_len("settledQuantities", v.len(), n)?;
    }

    let mut lots = Vec::with_capacity(n);
    for i in 0..n {
        let remaining = compressed.remaining_qtys[i];
        let ref_price = compressed.current_ref_prices[i];
        lots.push(TaxLot {
            id: compressed.ids[i],
            trade_date: compressed.trade_dates[i],
            settlement_date: compressed
                .settlement_dates
                .as_ref()
                .map(|v| v[i])
                .unwrap_or(None),
            original_qty: compressed
                .original_qtys
                .as_ref()
                .map(|v| v[i])
                .unwrap_or(remaining),
            remaining_qty: remaining,
            cost_basis: compressed
                .cost_bases
                .as_ref()
                .map(|v| v[i])
                .unwrap_or(ref_price),
            current_ref_price: ref_price,
            settled_quantity: compressed
                .settled_quantities
                .as_ref()
                .map(|v| v[i])
                .unwrap_or(None),
        });
    }
    Ok(lots)
}

fn check_len(field: &str, got: usize, want: usize) -> Result<(), EngineError> {
    if got != want {
        return Err(EngineError::DataCorruption {
            event_id: "compressed-lots".to_string(),
            detail: format!("array {} has length {}, expected {}", field, got, want),
        });
    }
    Ok(())
}

/// Marshal a payload to its stored JSON form.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<String, EngineError> {
    Ok(serde_json::to_string(value)?)
}

/// Unmarshal a stored payload. Unknown fields are ignored by construction;
/// decode failures are corruption, tagged by the caller.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, EngineError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn lot(qty: Decimal, basis: Decimal) -> TaxLot {
        TaxLot {
            id: Uuid::new_v4(),
            trade_date: NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            settlement_date: Some(NaiveDate::from_ymd_opt(2026, 1, 12).unwrap()),
            original_qty: qty,
            remaining_qty: qty,
            cost_basis: basis,
            current_ref_price: basis + dec!(1),
            settled_quantity: Some(qty / dec!(2)),
        }
    }

    #[test]
    fn inflate_reverses_compress() {
        let lots = vec![lot(dec!(100), dec!(50)), lot(dec!(-30), dec!(42.5))];
        let round_tripped = inflate(&compress(&lots)).unwrap();
        assert_eq!(round_tripped, lots);
    }

    #[test]
    fn legacy_shape_defaults_basis_and_original() {
        // Simulates a snapshot written before the richer arrays existed.
        let legacy = CompressedLots {
            ids: vec![Uuid::new_v4()],
            trade_dates: vec![NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()],
            settlement_dates: None,
            remaining_qtys: vec![dec!(75)],
            original_qtys: None,
            cost_bases: None,
            current_ref_prices: vec![dec!(12.25)],
            settled_quantities: None,
        };
        let lots = inflate(&legacy).unwrap();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].cost_basis, dec!(12.25));
        assert_eq!(lots[0].original_qty, dec!(75));
        assert_eq!(lots[0].settlement_date, None);
        assert_eq!(lots[0].settled_quantity, None);
    }

    #[test]
    fn mismatched_lengths_are_corruption() {
        let mut bad = compress(&[lot(dec!(10), dec!(5))]);
        bad.remaining_qtys.push(dec!(1));
        let err = inflate(&bad).unwrap_err();
        assert!(matches!(err, EngineError::DataCorruption { .. }));
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        #[derive(Deserialize)]
        struct Slim {
            a: u32,
        }
        let slim: Slim = decode_payload(r#"{"a": 1, "laterAddition": true}"#).unwrap();
        assert_eq!(slim.a, 1);
    }
}
