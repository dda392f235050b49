//! Stale-While-Revalidate Cache
//!
//! Hot keys are stored as a [`LogicalEnvelope`] with no physical TTL, so the
//! value never disappears from the store. Once the logical expiry passes,
//! readers keep getting the stale payload while one of them, holding the
//! key's rebuild lock, hands a rebuild to the background [`TaskPool`].
//!
//! ```text
//!   Absent ──put──▶ Fresh ──expiry──▶ Stale ──lock won──▶ Rebuilding
//!                     ▲                 │                     │
//!                     │                 └─ lock held: serve stale
//!                     └──────────── envelope rewritten ───────┘
//! ```
//!
//! A hard miss returns absent. Entries are created by [`LogicalCache::put`],
//! usually when the underlying record is written.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::codec::{decode_value, encode, CachePayload, LogicalEnvelope};
use crate::cache::executor::TaskPool;
use crate::cache::keys::CacheKey;
use crate::cache::lock::{LockLease, LockManager};
use crate::cache::metrics::CacheMetrics;
use crate::config::CacheSettings;
use crate::domain::events::CacheEvent;
use crate::domain::ports::VolatileStore;
use crate::error::Result;

/// Read path for keys that must never stampede the record store.
#[derive(Clone)]
pub struct LogicalCache {
    store: Arc<dyn VolatileStore>,
    locks: LockManager,
    pool: Arc<TaskPool>,
    settings: CacheSettings,
    metrics: Arc<CacheMetrics>,
}

impl LogicalCache {
    /// Create a logical cache over `store`, rebuilding on `pool`
    pub fn new(
        store: Arc<dyn VolatileStore>,
        pool: Arc<TaskPool>,
        settings: CacheSettings,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            locks: LockManager::new(store.clone()),
            store,
            pool,
            settings,
            metrics,
        }
    }

    /// Read `prefix + id`.
    ///
    /// A fresh payload is returned as is. A stale payload is returned
    /// immediately and, when this caller wins the rebuild lock, refreshed in
    /// the background through `fallback(id)`. The caller never waits on the
    /// rebuild.
    #[instrument(skip(self, fallback))]
    pub async fn get<T, F, Fut>(
        &self,
        prefix: &str,
        id: &str,
        fallback: F,
        logical_ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: CachePayload,
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let key = CacheKey::new(prefix, id);

        let Some(envelope) = self.read_envelope(&key).await else {
            self.metrics.record_miss();
            return Ok(None);
        };
        let Some(current) = self.decode_payload::<T>(&key, &envelope) else {
            self.metrics.record_miss();
            return Ok(None);
        };

        if envelope.is_fresh() {
            self.metrics.record_hit();
            debug!(key = %key, "Fresh hit");
            return Ok(Some(current));
        }

        self.metrics.record_stale_served();

        let lease = match self
            .locks
            .try_acquire(&key.lock_key(), self.settings.rebuild_lock_ttl)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                self.metrics.record_lock_contention();
                debug!(key = %key, "Rebuild already in flight, serving stale");
                return Ok(Some(current));
            }
            Err(e) => {
                self.metrics.record_store_error();
                warn!(key = %key, error = %e, "Rebuild lock unavailable, serving stale");
                return Ok(Some(current));
            }
        };

        // Another rebuilder may have landed between our read and the lock
        let latest = match self.read_envelope(&key).await {
            Some(latest) => latest,
            None => {
                self.locks.release(&lease).await;
                return Ok(Some(current));
            }
        };
        if latest.is_fresh() {
            self.locks.release(&lease).await;
            debug!(key = %key, "Envelope already rebuilt");
            return Ok(Some(self.decode_payload(&key, &latest).unwrap_or(current)));
        }

        self.submit_rebuild(key, lease, latest, fallback, logical_ttl)
            .await;
        Ok(Some(current))
    }

    /// Write `value` under `prefix + id`, fresh for `logical_ttl`.
    ///
    /// Returns an error only when the value cannot be encoded.
    pub async fn put<T: CachePayload>(
        &self,
        prefix: &str,
        id: &str,
        value: &T,
        logical_ttl: Duration,
    ) -> Result<()> {
        let key = CacheKey::new(prefix, id);
        let envelope = LogicalEnvelope::new(encode(value)?, logical_ttl)?;
        if let Err(e) = self.store.set(key.as_str(), &envelope.to_json()?, None).await {
            self.metrics.record_store_error();
            warn!(key = %key, error = %e, "Failed to write logical envelope");
        }
        Ok(())
    }

    /// Remove the envelope of `prefix + id`.
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
                warn!(key = %key, error = %e, "Failed to invalidate logical envelope");
                false
            }
        }
    }

    async fn read_envelope(&self, key: &CacheKey) -> Option<LogicalEnvelope> {
        let raw = match self.store.get(key.as_str()).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.metrics.record_store_error();
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };
        match LogicalEnvelope::from_json(&raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable envelope, treating as miss");
                None
            }
        }
    }

    fn decode_payload<T: CachePayload>(&self, key: &CacheKey, envelope: &LogicalEnvelope) -> Option<T> {
        match decode_value::<T>(&envelope.payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable envelope payload, treating as miss");
                None
            }
        }
    }

    async fn submit_rebuild<T, F, Fut>(
        &self,
        key: CacheKey,
        lease: LockLease,
        previous: LogicalEnvelope,
        fallback: F,
        logical_ttl: Duration,
    ) where
        T: CachePayload,
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let task = RebuildTask {
            store: self.store.clone(),
            locks: self.locks.clone(),
            metrics: self.metrics.clone(),
            key: key.clone(),
            lease: lease.clone(),
            previous,
            logical_ttl,
        };

        match self.pool.spawn(task.run(fallback)) {
            Ok(()) => {
                self.metrics.record_rebuild_submitted();
                debug!(key = %key, "Rebuild submitted");
            }
            Err(reason) => {
                self.metrics.record_rebuild_rejected();
                warn!(key = %key, reason = %reason, "Rebuild rejected, serving stale");
                self.locks.release(&lease).await;
            }
        }
    }
}

/// Background rebuild of one envelope. Owns the lease it must release.
struct RebuildTask {
    store: Arc<dyn VolatileStore>,
    locks: LockManager,
    metrics: Arc<CacheMetrics>,
    key: CacheKey,
    lease: LockLease,
    previous: LogicalEnvelope,
    logical_ttl: Duration,
}

impl RebuildTask {
    async fn run<T, F, Fut>(self, fallback: F)
    where
        T: CachePayload,
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.rebuild(fallback)).catch_unwind().await;

        match outcome {
            Ok(Ok(Some(logical_expire_at))) => {
                self.metrics.record_rebuild_completed();
                info!(key = %self.key, expire_at = %logical_expire_at, "Envelope rebuilt");
                CacheEvent::RebuildCompleted {
                    key: self.key.to_string(),
                    logical_expire_at,
                    duration_ms: started.elapsed().as_millis() as u64,
                    timestamp: Utc::now(),
                }
                .emit();
            }
            Ok(Ok(None)) => {
                self.metrics.record_rebuild_completed();
                info!(key = %self.key, "Record gone, envelope removed");
                CacheEvent::KeyInvalidated {
                    key: self.key.to_string(),
                    timestamp: Utc::now(),
                }
                .emit();
            }
            Ok(Err(e)) => self.fail(e.to_string()),
            Err(_) => self.fail("rebuild panicked".to_string()),
        }

        self.locks.release(&self.lease).await;
    }

    /// Returns the new expiry, or `None` when the record no longer exists.
    async fn rebuild<T, F, Fut>(&self, fallback: F) -> Result<Option<DateTime<Utc>>>
    where
        T: CachePayload,
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        self.metrics.record_fallback_call();
        match fallback(self.key.id().to_string()).await? {
            Some(value) => {
                let floor = self.expiry_floor().await;
                let envelope =
                    LogicalEnvelope::renewed(encode(&value)?, self.logical_ttl, Some(&floor))?;
                self.store
                    .set(self.key.as_str(), &envelope.to_json()?, None)
                    .await?;
                Ok(Some(envelope.logical_expire_at))
            }
            None => {
                self.store.delete(self.key.as_str()).await?;
                Ok(None)
            }
        }
    }

    /// Envelope whose expiry the rewrite must move past: the one read before
    /// the rebuild, or a later one written while this rebuild's lease lapsed.
    async fn expiry_floor(&self) -> LogicalEnvelope {
        let current = match self.store.get(self.key.as_str()).await {
            Ok(Some(raw)) => LogicalEnvelope::from_json(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                self.metrics.record_store_error();
                warn!(key = %self.key, error = %e, "Envelope re-read failed, using earlier expiry");
                None
            }
        };
        match current {
            Some(current) if current.logical_expire_at > self.previous.logical_expire_at => current,
            _ => self.previous.clone(),
        }
    }

    fn fail(&self, reason: String) {
        self.metrics.record_rebuild_failed();
        error!(key = %self.key, reason = %reason, "Rebuild failed, stale value stays visible");
        CacheEvent::RebuildFailed {
            key: self.key.to_string(),
            reason,
            timestamp: Utc::now(),
        }
        .emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryVolatileStore;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const PREFIX: &str = "link:hot:";
    const TTL: Duration = Duration::from_secs(60);

    struct Fixture {
        store: Arc<InMemoryVolatileStore>,
        pool: Arc<TaskPool>,
        metrics: Arc<CacheMetrics>,
        cache: LogicalCache,
    }

    fn fixture_with_pool(workers: usize, capacity: usize) -> Fixture {
        let store = Arc::new(InMemoryVolatileStore::new());
        let pool = Arc::new(TaskPool::new(workers, capacity).unwrap());
        let metrics = Arc::new(CacheMetrics::new());
        let cache = LogicalCache::new(
            store.clone(),
            pool.clone(),
            CacheSettings::default(),
            metrics.clone(),
        );
        Fixture {
            store,
            pool,
            metrics,
            cache,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_pool(2, 16)
    }

    async fn envelope(store: &InMemoryVolatileStore, key: &str) -> Option<LogicalEnvelope> {
        store
            .get(key)
            .await
            .unwrap()
            .map(|raw| LogicalEnvelope::from_json(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_hard_miss_returns_absent_without_fallback() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();

        let value: Option<String> = f
            .cache
            .get(PREFIX, "nope", move |_| async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(Some("x".to_string()))
            }, TTL)
            .await
            .unwrap();

        f.pool.wait_idle().await;
        assert!(value.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fresh_hit_never_rebuilds() {
        let f = fixture();
        f.cache.put(PREFIX, "hot", &"v1".to_string(), TTL).await.unwrap();

        let value: Option<String> = f
            .cache
            .get(PREFIX, "hot", |_| async {
                Err(Error::Internal("fallback must not run".into()))
            }, TTL)
            .await
            .unwrap();

        assert_eq!(value.as_deref(), Some("v1"));
        assert_eq!(f.metrics.snapshot().rebuilds_submitted, 0);
    }

    #[tokio::test]
    async fn test_stale_read_serves_old_value_and_rebuilds() {
        let f = fixture();
        f.cache
            .put(PREFIX, "hot", &"v1".to_string(), Duration::ZERO)
            .await
            .unwrap();
        let before = envelope(&f.store, "link:hot:hot").await.unwrap();

        let value: Option<String> = f
            .cache
            .get(PREFIX, "hot", |_| async { Ok(Some("v2".to_string())) }, TTL)
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("v1"));

        f.pool.wait_idle().await;
        let after = envelope(&f.store, "link:hot:hot").await.unwrap();
        assert_eq!(decode_value::<String>(&after.payload).unwrap(), "v2");
        assert!(after.logical_expire_at > before.logical_expire_at);
        assert!(after.is_fresh());
        assert!(f.store.get("lock:link:hot:hot").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_held_lock_serves_stale_without_rebuild() {
        let f = fixture();
        f.cache
            .put(PREFIX, "hot", &"v1".to_string(), Duration::ZERO)
            .await
            .unwrap();
        f.store
            .set_if_absent("lock:link:hot:hot", "someone-else", Duration::from_secs(5))
            .await
            .unwrap();

        let value: Option<String> = f
            .cache
            .get(PREFIX, "hot", |_| async { Ok(Some("v2".to_string())) }, TTL)
            .await
            .unwrap();

        assert_eq!(value.as_deref(), Some("v1"));
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.rebuilds_submitted, 0);
        assert_eq!(snapshot.lock_contention, 1);
    }

    #[tokio::test]
    async fn test_failed_rebuild_releases_lock_and_keeps_stale() {
        let f = fixture();
        f.cache
            .put(PREFIX, "hot", &"v1".to_string(), Duration::ZERO)
            .await
            .unwrap();

        let _: Option<String> = f
            .cache
            .get(PREFIX, "hot", |_| async {
                Err(Error::Durable("record store down".into()))
            }, TTL)
            .await
            .unwrap();
        f.pool.wait_idle().await;

        assert!(f.store.get("lock:link:hot:hot").await.unwrap().is_none());
        assert_eq!(f.metrics.snapshot().rebuilds_failed, 1);

        let value: Option<String> = f
            .cache
            .get(PREFIX, "hot", |_| async { Ok(Some("v2".to_string())) }, TTL)
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("v1"));
        f.pool.wait_idle().await;

        assert_eq!(f.metrics.snapshot().rebuilds_submitted, 2);
        let after = envelope(&f.store, "link:hot:hot").await.unwrap();
        assert_eq!(decode_value::<String>(&after.payload).unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_panicking_rebuild_releases_lock() {
        let f = fixture();
        f.cache
            .put(PREFIX, "hot", &"v1".to_string(), Duration::ZERO)
            .await
            .unwrap();

        let _: Option<String> = f
            .cache
            .get(PREFIX, "hot", |_| async {
                if true {
                    panic!("fallback blew up");
                }
                Ok(None)
            }, TTL)
            .await
            .unwrap();
        f.pool.wait_idle().await;

        assert!(f.store.get("lock:link:hot:hot").await.unwrap().is_none());
        assert_eq!(f.metrics.snapshot().rebuilds_failed, 1);
    }

    #[tokio::test]
    async fn test_absent_record_removes_envelope() {
        let f = fixture();
        f.cache
            .put(PREFIX, "gone", &"v1".to_string(), Duration::ZERO)
            .await
            .unwrap();

        let value: Option<String> = f
            .cache
            .get(PREFIX, "gone", |_| async { Ok(None) }, TTL)
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("v1"));

        f.pool.wait_idle().await;
        assert!(f.store.get("link:hot:gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_pool_rejects_and_releases_lock() {
        let f = fixture_with_pool(1, 1);
        let gate = Arc::new(Notify::new());

        let blocker = gate.clone();
        f.pool.spawn(async move { blocker.notified().await }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.pool.spawn(async {}).unwrap();

        f.cache
            .put(PREFIX, "hot", &"v1".to_string(), Duration::ZERO)
            .await
            .unwrap();
        let value: Option<String> = f
            .cache
            .get(PREFIX, "hot", |_| async { Ok(Some("v2".to_string())) }, TTL)
            .await
            .unwrap();

        assert_eq!(value.as_deref(), Some("v1"));
        assert_eq!(f.metrics.snapshot().rebuilds_rejected, 1);
        assert!(f.store.get("lock:link:hot:hot").await.unwrap().is_none());

        gate.notify_one();
        f.pool.wait_idle().await;
    }

    #[tokio::test]
    async fn test_store_outage_is_a_miss() {
        let f = fixture();
        f.cache.put(PREFIX, "hot", &"v1".to_string(), TTL).await.unwrap();
        f.store.set_unavailable(true);

        let value: Option<String> = f
            .cache
            .get(PREFIX, "hot", |_| async { Ok(Some("v2".to_string())) }, TTL)
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_envelope() {
        let f = fixture();
        f.cache.put(PREFIX, "hot", &42u64, TTL).await.unwrap();
        assert!(f.cache.invalidate(PREFIX, "hot").await);

        let value: Option<u64> = f
            .cache
            .get(PREFIX, "hot", |_| async { Ok(Some(1)) }, TTL)
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_slow_rebuild_never_moves_expiry_backwards() {
        let f = fixture();
        f.cache.put(PREFIX, "k", &"v1".to_string(), Duration::ZERO).await.unwrap();
        let gate = Arc::new(Notify::new());

        let waiting = gate.clone();
        let _: Option<String> = f
            .cache
            .get(
                PREFIX,
                "k",
                move |_| async move {
                    waiting.notified().await;
                    Ok(Some("slow".to_string()))
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        // A later writer lands while the slow rebuild is still running
        f.cache
            .put(PREFIX, "k", &"newer".to_string(), Duration::from_secs(3600))
            .await
            .unwrap();
        let newer = envelope(&f.store, "link:hot:k").await.unwrap();

        gate.notify_one();
        f.pool.wait_idle().await;

        let written = envelope(&f.store, "link:hot:k").await.unwrap();
        assert!(written.logical_expire_at > newer.logical_expire_at);
        assert_eq!(f.metrics.snapshot().rebuilds_completed, 1);
    }
}
