//! Abstract message-bus ports.
//!
//! The engine only ever sees these traits; vendor bindings live outside
//! this crate. The producer's `key` argument must be used as the bus's
//! partitioning key so downstream consumers in one group observe per-key
//! order. Handlers settle every delivery exactly once: ack on success or
//! terminal routing, nack to request redelivery. A delivery dropped
//! without settling (crash, timeout) counts as a nack.

pub mod memory;

pub use memory::MemoryBus;

use crate::engine::error::EngineError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

/// One-shot settlement handle attached to a delivery.
pub struct Acker {
    complete: Option<Box<dyn FnOnce(Disposition) + Send>>,
}

impl Acker {
    pub fn new(complete: impl FnOnce(Disposition) + Send + 'static) -> Self {
        Self {
            complete: Some(Box::new(complete)),
        }
    }

    /// Handle that settles nowhere (tests, fire-and-forget sinks).
    pub fn noop() -> Self {
        Self { complete: None }
    }

    pub fn ack(mut self) {
        self.fire(Disposition::Ack);
    }

    pub fn nack(mut self) {
        self.fire(Disposition::Nack);
    }

    fn fire(&mut self, disposition: Disposition) {
        if let Some(complete) = self.complete.take() {
            complete(disposition);
        }
    }
}

impl Drop for Acker {
    fn drop(&mut self) {
        // An unsettled delivery is redelivered.
        self.fire(Disposition::Nack);
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("settled", &self.complete.is_none())
            .finish()
    }
}

/// A message as seen by a handler.
#[derive(Debug)]
pub struct Delivery {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, bumped per redelivery.
    pub attempt: u32,
    pub acker: Acker,
}

#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), EngineError>;
}

#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Register a handler; takes effect on `start`.
    fn subscribe(&self, topic: &str, handler: Arc<dyn BusHandler>);
    async fn start(&self) -> Result<(), EngineError>;
    async fn stop(&self);
}

pub type SharedProducer = Arc<dyn BusProducer>;
