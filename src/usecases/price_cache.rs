//! Price Cache - Short-TTL Store in Front of the Upstream API
//!
//! Serves recently validated readings so simultaneous requests don't
//! each hit the rate-limited market API. Expiry is lazy: an entry past
//! its TTL is evicted by the read that finds it. Key cardinality is
//! tiny, so no background sweep.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::price::PriceReading;

/// A cached reading and its lifetime.
#[derive(Debug, Clone, Copy)]
pub struct CacheEntry {
    pub reading: PriceReading,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// TTL-keyed reading store.
pub struct PriceCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
}

impl PriceCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// The stored reading, unchanged, if present and within its TTL.
    pub fn get(&self, key: &str) -> Option<PriceReading> {
        let now = Instant::now();

        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.reading),
                Some(_) => {}
            }
        }

        // Expired under the read lock; re-check under the write lock in
        // case a writer refreshed it in between.
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.reading),
            Some(_) => {
                entries.remove(key);
                debug!(key, "Evicted expired cache entry");
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite `key`.
    pub fn set(&self, key: &str, reading: PriceReading, ttl: Duration) {
        let entry = CacheEntry {
            reading,
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries.write().insert(key.to_string(), entry);
    }

    /// `set` with the cache's default TTL.
    pub fn insert(&self, key: &str, reading: PriceReading) {
        self.set(key, reading, self.default_ttl);
    }

    pub fn clear(&self, key: &str) {
        self.entries.write().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.write().clear();
    }

    /// Number of stored entries, expired ones included until read.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}
