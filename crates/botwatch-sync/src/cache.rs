//! # TTL Cache
//!
//! Expiring key/value store shared by every fetch of the data access layer.
//!
//! ## Expiry Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Entry Lifetime                                │
//! │                                                                         │
//! │   set(k, v, ttl) at t0                                                 │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   ─────●══════════════════════════════○──────────────────────────▶ t   │
//! │        t0          live (hit)          t0 + ttl   expired (miss)        │
//! │                                                                         │
//! │   get() at t <  t0 + ttl  → Some(v)                                    │
//! │   get() at t >= t0 + ttl  → None, entry evicted on the spot            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Expiry is lazy: nothing runs in the background. [`TtlCache::purge_expired`]
//! sweeps on demand.
//!
//! Time comes from `tokio::time::Instant` so tests can drive it with a
//! paused clock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Thread-safe expiring cache.
///
/// The lock is held only for map access and never across an await point.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        TtlCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        // Poisoning is ignored: no operation leaves the map half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `value` until `now + ttl`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let expires_at = Instant::now() + ttl;
        trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set");
        self.lock().insert(key, CacheEntry { value, expires_at });
    }

    /// Returns the value if it is still live. An expired entry is evicted.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                trace!(key = %key, "cache entry expired");
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Removes one entry. Returns true if it existed (live or not).
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Removes every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Drops every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
