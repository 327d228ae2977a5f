//! Position-management engine for equity-swap trades.
//!
//! Exposes the engine, stores and ports for use by the binary and the
//! integration tests.

pub mod bus;
pub mod cache;
pub mod config;
pub mod engine;
pub mod models;
pub mod store;

pub use config::Config;
pub use engine::{ColdpathRecalculator, Dispatcher, EngineError, HotpathProcessor};
pub use store::Database;
