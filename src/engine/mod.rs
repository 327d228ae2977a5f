//! Event-sourced position engine.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!                 │                 Dispatcher                   │
//!                 │  (bus subscriber, key-partitioned workers)   │
//!                 └──────────────────────────────────────────────┘
//!                        │                            │
//!                trade-events                 backdated-trades
//!                        ▼                            ▼
//!               ┌─────────────────┐         ┌──────────────────┐
//!               │ Validation gate │         │    Coldpath      │
//!               │   + Hotpath     │         │  recalculator    │
//!               └─────────────────┘         └──────────────────┘
//!                        │                            │
//!          ┌─────────────┼──────────────┬─────────────┘
//!          ▼             ▼              ▼
//!   ┌────────────┐ ┌────────────┐ ┌─────────────┐
//!   │ Event store│ │  Snapshot  │ │ Idempotency │   (one txn per trade)
//!   │ (append)   │ │  (rewrite) │ │  (dedupe)   │
//!   └────────────┘ └────────────┘ └─────────────┘
//! ```
//!
//! Per-position ordering comes from the dispatcher hashing every key to a
//! fixed worker; nothing below it takes locks for correctness.

pub mod classifier;
pub mod codec;
pub mod coldpath;
pub mod contracts;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod hotpath;
pub mod lots;
pub mod position_key;
pub mod reconciliation;
pub mod replay;
pub mod state;
pub mod state_machine;
pub mod validation;

#[cfg(test)]
mod hotpath_tests;

pub use classifier::{classify_with_today, Classifier};
pub use codec::{compress, inflate, CompressedLots};
pub use coldpath::{ColdpathOutcome, ColdpathRecalculator};
pub use contracts::{
    CircuitBreakerContractService, ContractRulesResolver, ContractService, MockContractService,
    RestContractService, RetryingContractService, SharedContractService,
};
pub use dispatcher::Dispatcher;
pub use error::EngineError;
pub use events::{
    canonical_order, CorrectionPayload, EventType, HistoricalCorrectionPayload, PositionEvent,
    TradePayload,
};
pub use hotpath::{position_cache_key, HotpathProcessor, ProcessOutcome};
pub use lots::{LotAllocation, LotAllocationEntry, TaxLot};
pub use position_key::{inverse_key, partition, position_key};
pub use reconciliation::ReconciliationChecker;
pub use replay::ReplayRun;
pub use state::{PositionState, PositionStatus, ReconciliationStatus, SchedulePoint};
pub use state_machine::{transition, LifecycleState, Transition};
pub use validation::{validate, ValidationFailure};
