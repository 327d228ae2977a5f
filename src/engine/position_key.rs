//! Position-key derivation and partition assignment.
//!
//! The key is a SHA-256 fingerprint of the normalized identifying tuple.
//! Normalization (trim + uppercase) makes the key insensitive to the case
//! and whitespace noise upstream systems introduce; the direction flag keeps
//! LONG and SHORT legs of the same triple on distinct keys.

use crate::engine::error::EngineError;
use crate::models::Direction;
use sha2::{Digest, Sha256};

/// Derive the 64-hex-char position key for `(account, instrument, currency,
/// direction)`. Empty fields (after trimming) are rejected.
pub fn position_key(
    account: &str,
    instrument: &str,
    currency: &str,
    direction: Direction,
) -> Result<String, EngineError> {
    let account = normalize(account, "account")?;
    let instrument = normalize(instrument, "instrument")?;
    let currency = normalize(currency, "currency")?;

    let mut hasher = Sha256::new();
    hasher.update(account.as_bytes());
    hasher.update(b"|");
    hasher.update(instrument.as_bytes());
    hasher.update(b"|");
    hasher.update(currency.as_bytes());
    hasher.update(b"|");
    hasher.update(direction.as_str().as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Key of the opposite-direction leg of the same triple.
pub fn inverse_key(
    account: &str,
    instrument: &str,
    currency: &str,
    direction: Direction,
) -> Result<String, EngineError> {
    position_key(account, instrument, currency, direction.opposite())
}

/// Partition assignment: big-endian u32 of the first four key bytes, mod n.
/// `n` comes from configuration (default 16).
pub fn partition(key: &str, n: u32) -> Result<u32, EngineError> {
    if key.len() < 8 {
        return Err(EngineError::InvalidArgument(format!(
            "position key too short: {}",
            key
        )));
    }
    let bytes = hex::decode(&key[..8])
        .map_err(|e| EngineError::InvalidArgument(format!("position key not hex: {}", e)))?;
    let prefix = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok(prefix % n)
}

fn normalize(value: &str, field: &str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidArgument(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(trimmed.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_and_normalized() {
        let a = position_key("ACC", "AAPL", "USD", Direction::Long).unwrap();
        let b = position_key("  acc ", "aapl", " usd", Direction::Long).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn long_and_short_differ() {
        let long = position_key("ACC", "AAPL", "USD", Direction::Long).unwrap();
        let short = position_key("ACC", "AAPL", "USD", Direction::Short).unwrap();
        assert_ne!(long, short);
        assert_eq!(
            inverse_key("ACC", "AAPL", "USD", Direction::Long).unwrap(),
            short
        );
    }

    #[test]
    fn empty_fields_rejected() {
        assert!(position_key("", "AAPL", "USD", Direction::Long).is_err());
        assert!(position_key("ACC", "   ", "USD", Direction::Long).is_err());
    }

    #[test]
    fn distinct_inputs_do_not_collide() {
        let keys: Vec<String> = [
            ("ACC1", "AAPL", "USD"),
            ("ACC2", "AAPL", "USD"),
            ("ACC1", "MSFT", "USD"),
            ("ACC1", "AAPL", "EUR"),
            ("ACC-1", "AAPL", "USD"),
        ]
        .iter()
        .map(|(a, i, c)| position_key(a, i, c, Direction::Long).unwrap())
        .collect();
        let mut dedup = keys.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), keys.len());
    }

    #[test]
    fn partition_is_stable_and_bounded() {
        let key = position_key("ACC", "AAPL", "USD", Direction::Long).unwrap();
        let p = partition(&key, 16).unwrap();
        assert_eq!(p, partition(&key, 16).unwrap());
        assert!(p < 16);
        for n in [1u32, 2, 7, 64] {
            assert!(partition(&key, n).unwrap() < n);
        }
    }
}
