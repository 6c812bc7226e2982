//! # TTL cache
//! Key → value map with absolute expiry. Eviction is read-triggered only; there is no
//! background sweeper. Not synchronised: owners wrap it in a lock.
//!
//! Uses `tokio::time::Instant` so tests can drive expiry with a paused clock.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
}

impl<K, V> Default for TtlCache<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` until `now + ttl`, replacing any prior entry.
    pub fn set(&mut self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Fresh value only. An expired entry is evicted and reported as absent.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(e) if now <= e.expires_at => Some(e.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Any entry, fresh or not, with `true` when it is past its expiry.
    pub fn get_with_stale(&self, key: &K) -> Option<(V, bool)> {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|e| (e.value.clone(), now > e.expires_at))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
