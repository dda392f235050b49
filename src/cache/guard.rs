//! Negative-Cache Guard
//!
//! Read-through lookup that caches confirmed absence. A miss that the record
//! store also cannot answer writes a tombstone with a randomized short TTL,
//! so repeated lookups of a missing key stop at the cache instead of hitting
//! the store on every request.
//!
//! ```text
//!   get(prefix, id)
//!        │
//!        ▼
//!   store.get(key) ──── payload ───▶ decode ──▶ value
//!        │         └─── tombstone ─▶ absent
//!        │ miss / store error / undecodable
//!        ▼
//!   fallback(id) ──── Some(v) ──▶ set(key, v, ttl) ──▶ value
//!               └──── None ─────▶ set(key, "", random ttl) ──▶ absent
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::cache::codec::{decode, encode, CachePayload, TOMBSTONE};
use crate::cache::keys::CacheKey;
use crate::cache::metrics::CacheMetrics;
use crate::config::CacheSettings;
use crate::domain::events::CacheEvent;
use crate::domain::ports::VolatileStore;
use crate::error::Result;

/// Cached lookup state of a key
enum Lookup<T> {
    Value(T),
    Tombstone,
    Miss,
}

/// Read-through cache with penetration protection.
#[derive(Clone)]
pub struct NegativeCacheGuard {
    store: Arc<dyn VolatileStore>,
    settings: CacheSettings,
    metrics: Arc<CacheMetrics>,
}

impl NegativeCacheGuard {
    /// Create a guard over `store`
    pub fn new(
        store: Arc<dyn VolatileStore>,
        settings: CacheSettings,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            store,
            settings,
            metrics,
        }
    }

    /// Look up `prefix + id`, falling back to `fallback(id)` on a true miss.
    ///
    /// Only a fallback error reaches the caller. Store failures and
    /// undecodable entries are treated as a miss.
    #[instrument(skip(self, fallback))]
    pub async fn get<T, F, Fut>(
        &self,
        prefix: &str,
        id: &str,
        fallback: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: CachePayload,
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = CacheKey::new(prefix, id);

        match self.lookup::<T>(&key).await {
            Lookup::Value(value) => {
                self.metrics.record_hit();
                debug!(key = %key, "Guard hit");
                return Ok(Some(value));
            }
            Lookup::Tombstone => {
                self.metrics.record_tombstone_hit();
                debug!(key = %key, "Guard tombstone hit");
                return Ok(None);
            }
            Lookup::Miss => self.metrics.record_miss(),
        }

        self.metrics.record_fallback_call();
        match fallback(id.to_string()).await? {
            Some(value) => {
                self.write_value(&key, &value, ttl).await;
                Ok(Some(value))
            }
            None => {
                self.write_tombstone(&key).await;
                Ok(None)
            }
        }
    }

    /// Pre-warm `prefix + id` with `value`.
    ///
    /// Returns an error only when the value cannot be encoded.
    pub async fn put<T: CachePayload>(
        &self,
        prefix: &str,
        id: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let key = CacheKey::new(prefix, id);
        let encoded = encode(value)?;
        if let Err(e) = self.store.set(key.as_str(), &encoded, Some(ttl)).await {
            self.metrics.record_store_error();
            warn!(key = %key, error = %e, "Failed to pre-warm cache entry");
        }
        Ok(())
    }

    /// Drop the cached entry (value or tombstone) for `prefix + id`.
    pub async fn invalidate(&self, prefix: &str, id: &str) -> bool {
        let key = CacheKey::new(prefix, id);
        match self.store.delete(key.as_str()).await {
            Ok(removed) => {
                CacheEvent::KeyInvalidated {
                    key: key.to_string(),
                    timestamp: Utc::now(),
                }
                .emit();
                removed
            }
            Err(e) => {
                self.metrics.record_store_error();
                warn!(key = %key, error = %e, "Failed to invalidate cache entry");
                false
            }
        }
    }

    async fn lookup<T: CachePayload>(&self, key: &CacheKey) -> Lookup<T> {
        let raw = match self.store.get(key.as_str()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                self.metrics.record_store_error();
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return Lookup::Miss;
            }
        };

        if raw == TOMBSTONE {
            return Lookup::Tombstone;
        }

        match decode::<T>(&raw).map(|decoded| decoded.into_value()) {
            Ok(Some(value)) => Lookup::Value(value),
            Ok(None) => Lookup::Miss,
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable cache entry, treating as miss");
                Lookup::Miss
            }
        }
    }

    async fn write_value<T: CachePayload>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let encoded = match encode(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode value, not caching");
                return;
            }
        };
        if let Err(e) = self.store.set(key.as_str(), &encoded, Some(ttl)).await {
            self.metrics.record_store_error();
            warn!(key = %key, error = %e, "Failed to cache value");
        }
    }

    async fn write_tombstone(&self, key: &CacheKey) {
        let ttl = self.settings.tombstone_ttl();
        match self.store.set(key.as_str(), TOMBSTONE, Some(ttl)).await {
            Ok(()) => CacheEvent::TombstoneWritten {
                key: key.to_string(),
                ttl_secs: ttl.as_secs(),
                timestamp: Utc::now(),
            }
            .emit(),
            Err(e) => {
                self.metrics.record_store_error();
                warn!(key = %key, error = %e, "Failed to write tombstone");
            }
        }
    }
}
