//! In-memory cache with a fixed time-to-live
//!
//! Entries are stamped against the injected [`Clock`], so expiry can be
//! asserted in tests by moving a `ManualClock` instead of sleeping.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use super::clock::Clock;

struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Simple TTL cache shared behind an `Arc`
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a live entry
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let entries = self.entries.read();
        entries.get(key).and_then(|entry| {
            if entry.expires_at > now {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: K, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        self.entries
            .write()
            .insert(key, CacheEntry { value, expires_at });
    }

    pub fn remove(&self, key: &K) {
        self.entries.write().remove(key);
    }

    /// Return the cached value or compute and store it
    ///
    /// Failures are not cached. Concurrent misses for the same key may both
    /// compute; the last one to finish wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let value = fetch().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Remove expired entries
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.entries.read().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
