//! Abstract cache port.
//!
//! The engine treats every cached value as a hint: correctness must hold
//! with an empty cache, and any entry may vanish at any time. Values are
//! stored as serialized JSON so bindings stay byte-oriented.

pub mod memory;

pub use memory::MemoryCache;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_raw(&self, key: &str) -> Option<Vec<u8>>;
    /// `ttl` of `None` (or zero) means no expiration.
    async fn put_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);
    async fn evict(&self, key: &str);
    async fn exists(&self, key: &str) -> bool;
}

/// Typed helpers over the byte-oriented port. Decode failures are treated
/// as a miss; a stale or foreign value must never poison a caller.
#[async_trait]
pub trait CacheExt: Cache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await?;
        serde_json::from_slice(&raw).ok()
    }

    async fn put<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        if let Ok(raw) = serde_json::to_vec(value) {
            self.put_raw(key, raw, ttl).await;
        }
    }

    async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        supplier: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: Send,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }
        let value = supplier().await?;
        self.put(key, &value, ttl).await;
        Ok(value)
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Shared handle used across the engine.
pub type SharedCache = Arc<dyn Cache>;
