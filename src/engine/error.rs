//! Engine error kinds and their routing semantics.
//!
//! Each kind maps to exactly one disposition at the bus boundary:
//! terminal kinds are acknowledged after DLQ routing, transient kinds are
//! nacked for redelivery, version conflicts are retried internally.

use crate::store::StoreError;
use std::fmt;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed trade or field out of range. Terminal; DLQ.
    InvalidArgument(String),
    /// The lifecycle state machine rejected the transition. Terminal; DLQ.
    StateViolation(String),
    /// Snapshot or event absent where required. Handled locally.
    NotFound(String),
    /// Optimistic-lock clash on snapshot save. Retried internally.
    VersionConflict(String),
    /// Timeouts, socket errors, storage hiccups. Nack; redelivery expected.
    Transient(String),
    /// A stored payload failed to decode. The event is skipped during
    /// replay and the position is marked PENDING.
    DataCorruption { event_id: String, detail: String },
    /// Storage unavailable beyond budget; the worker stops.
    Fatal(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(m) => write!(f, "invalid argument: {}", m),
            Self::StateViolation(m) => write!(f, "state violation: {}", m),
            Self::NotFound(m) => write!(f, "not found: {}", m),
            Self::VersionConflict(m) => write!(f, "version conflict: {}", m),
            Self::Transient(m) => write!(f, "transient failure: {}", m),
            Self::DataCorruption { event_id, detail } => {
                write!(f, "corrupt payload for event {}: {}", event_id, detail)
            }
            Self::Fatal(m) => write!(f, "fatal: {}", m),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Terminal errors go to the DLQ and are acknowledged; they are never
    /// redelivered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::StateViolation(_))
    }

    /// Transient errors are nacked so the bus redelivers; idempotency makes
    /// the retry safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::VersionConflict(_))
    }

    /// Stable label carried on DLQ messages and metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::StateViolation(_) => "STATE_VIOLATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::VersionConflict(_) => "VERSION_CONFLICT",
            Self::Transient(_) => "TRANSIENT",
            Self::DataCorruption { .. } => "DATA_CORRUPTION",
            Self::Fatal(_) => "FATAL",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict(m) => Self::VersionConflict(m),
            StoreError::NotFound(m) => Self::NotFound(m),
            StoreError::Corrupt(m) => Self::DataCorruption {
                event_id: "unknown".to_string(),
                detail: m,
            },
            StoreError::Serialization(e) => Self::DataCorruption {
                event_id: "unknown".to_string(),
                detail: e.to_string(),
            },
            // Connection-level failures are redeliverable; the bus retries.
            StoreError::Sqlite(e) => Self::Transient(format!("sqlite: {}", e)),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::DataCorruption {
            event_id: "unknown".to_string(),
            detail: e.to_string(),
        }
    }
}
