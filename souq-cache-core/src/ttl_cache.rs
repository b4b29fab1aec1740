//! Generic TTL key/value cache over the persistence provider.
//!
//! Stores serializable values under string keys with a per-entry expiration
//! and hit/miss/invalidation counters. Expiration is lazy: an expired entry
//! is deleted on the `get` that discovers it, never by a background sweep.
//! An entry only becomes valid again through an explicit `set`.

use crate::error::CacheError;
use crate::storage::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};

const KEY_PREFIX: &str = "ttl_cache:";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    data: serde_json::Value,
    timestamp: OffsetDateTime,
    expires_at: OffsetDateTime,
    hits: u64,
}

/// Running counters, diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TtlCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub total_reads: u64,
}

impl TtlCacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.total_reads == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_reads as f64
        }
    }
}

pub struct TtlCache {
    store: Arc<dyn KeyValueStore>,
    // Keys touched by this instance; the provider contract has no key
    // enumeration, so clear() operates on these.
    known_keys: Mutex<HashSet<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    total_reads: AtomicU64,
}

impl TtlCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        TtlCache {
            store,
            known_keys: Mutex::new(HashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            total_reads: AtomicU64::new(0),
        }
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    /// Store `value` under `key` for `ttl`. Failures are logged and
    /// swallowed; the entry is simply absent on the next `get`.
    pub async fn set<V: Serialize>(&self, key: &str, value: &V, ttl: Duration) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Failed to serialize cache value for '{}': {}", key, e);
                return;
            }
        };

        let now = OffsetDateTime::now_utc();
        let envelope = Envelope {
            data,
            timestamp: now,
            expires_at: now + ttl,
            hits: 0,
        };

        if let Err(e) = self.write_envelope(key, &envelope).await {
            log::warn!("Failed to write cache entry '{}': {}", key, e);
            return;
        }

        self.known_keys.lock().unwrap().insert(key.to_string());
        log::debug!("Cached '{}' for {}ms", key, ttl.whole_milliseconds());
    }

    /// Fetch the value stored under `key`, or `None` if it is absent,
    /// expired or unreadable. A hit bumps the entry's hit counter and
    /// re-persists it.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        self.total_reads.fetch_add(1, Ordering::Relaxed);

        let raw = match self.store.get_item(&Self::storage_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                log::debug!("CACHE MISS: '{}'", key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                log::warn!("Failed to read cache entry '{}': {}", key, e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let mut envelope: Envelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Corrupt cache entry '{}', discarding: {}", key, e);
                self.remove_stored(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if OffsetDateTime::now_utc() > envelope.expires_at {
            log::debug!("CACHE EXPIRED: '{}'", key);
            self.remove_stored(key).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let value: V = match serde_json::from_value(envelope.data.clone()) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Cache entry '{}' has unexpected shape, discarding: {}", key, e);
                self.remove_stored(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        envelope.hits += 1;
        if let Err(e) = self.write_envelope(key, &envelope).await {
            log::warn!("Failed to update hit counter for '{}': {}", key, e);
        }
        self.known_keys.lock().unwrap().insert(key.to_string());
        self.hits.fetch_add(1, Ordering::Relaxed);
        log::debug!("CACHE HIT: '{}' ({} hits)", key, envelope.hits);

        Some(value)
    }

    /// Remove the entry under `key`. Invalidating an absent key is a no-op
    /// and does not count towards the stats.
    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.store.remove_item(&Self::storage_key(key)).await {
            log::warn!("Failed to invalidate cache entry '{}': {}", key, e);
            return;
        }
        if self.known_keys.lock().unwrap().remove(key) {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            log::debug!("Invalidated cache entry '{}'", key);
        }
    }

    pub async fn invalidate_multiple(&self, keys: &[String]) {
        for key in keys {
            self.invalidate(key).await;
        }
    }

    /// Remove every entry this instance has touched.
    pub async fn clear(&self) {
        let keys: Vec<String> = self.known_keys.lock().unwrap().drain().collect();
        for key in &keys {
            if let Err(e) = self.store.remove_item(&Self::storage_key(key)).await {
                log::warn!("Failed to remove cache entry '{}': {}", key, e);
            }
        }
        self.invalidations
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        log::info!("Cleared {} cache entries", keys.len());
    }

    pub fn stats(&self) -> TtlCacheStats {
        TtlCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
        }
    }

    async fn write_envelope(&self, key: &str, envelope: &Envelope) -> Result<(), CacheError> {
        let json = serde_json::to_string(envelope)?;
        self.store.set_item(&Self::storage_key(key), &json).await
    }

    async fn remove_stored(&self, key: &str) {
        if let Err(e) = self.store.remove_item(&Self::storage_key(key)).await {
            log::warn!("Failed to remove cache entry '{}': {}", key, e);
        }
        self.known_keys.lock().unwrap().remove(key);
    }
}
