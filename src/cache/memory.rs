//! In-process cache binding.

use super::Cache;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// HashMap-backed cache with lazy TTL expiry. Expired entries are dropped
/// on read and by an occasional full sweep on write.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    writes_since_sweep: RwLock<u64>,
}

const SWEEP_EVERY_WRITES: u64 = 1024;

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep_if_due(&self) {
        let due = {
            let mut count = self.writes_since_sweep.write();
            *count += 1;
            *count % SWEEP_EVERY_WRITES == 0
        };
        if due {
            let now = Instant::now();
            self.entries.write().retain(|_, e| !e.is_expired(now));
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(e) if !e.is_expired(now) => return Some(e.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it under the write lock.
        self.entries.write().remove(key);
        None
    }

    async fn put_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = match ttl {
            None => None,
            Some(d) if d.is_zero() => None,
            Some(d) => Some(Instant::now() + d),
        };
        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        self.sweep_if_due();
    }

    async fn evict(&self, key: &str) {
        self.entries.write().remove(key);
    }

    async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }
}
