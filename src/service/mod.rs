//! Link Service
//!
//! Facade wiring the cache tier to a short-link record store. It owns two
//! [`TaskPool`]s, one for stale-entry rebuilds and one for access events, so
//! an access burst never crowds rebuilds out. It also owns the shared
//! [`CacheMetrics`] and exposes the operations a request-handling layer
//! needs:
//!
//! ```text
//!   create ─────▶ save ──▶ pre-warm guard + hot envelope
//!   resolve ────▶ NegativeCacheGuard ──▶ record store on miss
//!   resolve_hot ▶ LogicalCache ──▶ guard path on hard miss
//!   update ─────▶ save ──▶ invalidate guard, rewrite hot envelope
//!   delete ─────▶ delete ──▶ invalidate both
//!   record_access ▶ access pool ──▶ owner lookup ──▶ CounterAggregator
//!   list_for_owner ▶ durable totals + unflushed deltas
//!   top ────────▶ RankingReader
//! ```

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cache::executor::{SubmitError, TaskPool};
use crate::cache::guard::NegativeCacheGuard;
use crate::cache::keys::{LINK_CACHE_PREFIX, LINK_HOT_PREFIX};
use crate::cache::logical::LogicalCache;
use crate::cache::metrics::{CacheMetrics, MetricsSnapshot};
use crate::config::CacheSettings;
use crate::counter::aggregator::CounterAggregator;
use crate::counter::ranking::{RankedItem, RankingReader};
use crate::domain::ports::{OwnerId, RankingScope, RecordStore, TrackedRecord, VolatileStore};
use crate::error::{Error, Result};

/// Short-link operations backed by the cache tier.
pub struct LinkService {
    durable: Arc<dyn RecordStore>,
    guard: NegativeCacheGuard,
    logical: LogicalCache,
    aggregator: CounterAggregator,
    ranking: RankingReader,
    rebuild_pool: Arc<TaskPool>,
    access_pool: Arc<TaskPool>,
    settings: CacheSettings,
    metrics: Arc<CacheMetrics>,
}

impl LinkService {
    /// Build the cache tier over `store` and `durable`.
    ///
    /// Starts the background pools, so it must be called from within a Tokio
    /// runtime.
    pub fn new(
        store: Arc<dyn VolatileStore>,
        durable: Arc<dyn RecordStore>,
        settings: CacheSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let rebuild_pool = Arc::new(TaskPool::new(
            settings.rebuild_workers,
            settings.rebuild_queue_capacity,
        )?);
        let access_pool = Arc::new(TaskPool::new(
            settings.access_workers,
            settings.access_queue_capacity,
        )?);
        let metrics = Arc::new(CacheMetrics::new());

        let guard = NegativeCacheGuard::new(store.clone(), settings.clone(), metrics.clone());
        let logical = LogicalCache::new(
            store.clone(),
            rebuild_pool.clone(),
            settings.clone(),
            metrics.clone(),
        );
        let aggregator = CounterAggregator::new(
            store.clone(),
            durable.clone(),
            access_pool.clone(),
            settings.clone(),
            metrics.clone(),
        );
        let ranking = RankingReader::new(
            store,
            durable.clone(),
            guard.clone(),
            settings.clone(),
            metrics.clone(),
        );

        info!(
            flush_threshold = settings.flush_threshold,
            rebuild_workers = settings.rebuild_workers,
            access_workers = settings.access_workers,
            "Link service ready"
        );

        Ok(Self {
            durable,
            guard,
            logical,
            aggregator,
            ranking,
            rebuild_pool,
            access_pool,
            settings,
            metrics,
        })
    }

    /// Persist a new link and pre-warm both read paths.
    #[instrument(skip(self, record), fields(id = %record.id))]
    pub async fn create(&self, record: TrackedRecord) -> Result<TrackedRecord> {
        let saved = self.durable.save(record).await?;
        self.prewarm(&saved).await?;
        debug!(id = %saved.id, "Link created");
        Ok(saved)
    }

    /// Resolve a link's payload through the negative-cache guard.
    pub async fn resolve(&self, id: &str) -> Result<Option<String>> {
        let durable = self.durable.clone();
        self.guard
            .get(
                LINK_CACHE_PREFIX,
                id,
                |id| async move {
                    let record = durable.find_by_key(&id).await?;
                    Ok::<_, Error>(record.map(|record| record.payload))
                },
                self.settings.value_ttl,
            )
            .await
    }

    /// Resolve a hot link stale-while-revalidate.
    ///
    /// Links without an envelope fall back to [`LinkService::resolve`].
    pub async fn resolve_hot(&self, id: &str) -> Result<Option<String>> {
        let durable = self.durable.clone();
        let hot = self
            .logical
            .get(
                LINK_HOT_PREFIX,
                id,
                move |id| async move {
                    let record = durable.find_by_key(&id).await?;
                    Ok::<_, Error>(record.map(|record| record.payload))
                },
                self.settings.logical_ttl,
            )
            .await?;

        match hot {
            Some(payload) => Ok(Some(payload)),
            None => self.resolve(id).await,
        }
    }

    /// Replace a link's payload, keeping its owner and total.
    #[instrument(skip(self, payload))]
    pub async fn update(&self, id: &str, payload: &str) -> Result<TrackedRecord> {
        let mut record = self
            .durable
            .find_by_key(id)
            .await?
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
        record.payload = payload.to_string();

        let saved = self.durable.save(record).await?;
        self.guard.invalidate(LINK_CACHE_PREFIX, id).await;
        self.logical
            .put(LINK_HOT_PREFIX, id, &saved.payload, self.settings.logical_ttl)
            .await?;
        info!(id = %id, "Link updated");
        Ok(saved)
    }

    /// Delete a link and drop its cached entries.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.durable.delete(id).await?;
        self.guard.invalidate(LINK_CACHE_PREFIX, id).await;
        self.logical.invalidate(LINK_HOT_PREFIX, id).await;
        if removed {
            info!(id = %id, "Link deleted");
        }
        Ok(removed)
    }

    /// Count an access in the background. The owner is looked up on the
    /// access pool, off the caller's path; unknown links are not counted.
    ///
    /// Waits for queue space when the access pool is saturated, so accesses
    /// are delayed rather than lost. Fails only after [`LinkService::shutdown`].
    pub async fn record_access(&self, id: &str) -> std::result::Result<(), SubmitError> {
        let durable = self.durable.clone();
        let aggregator = self.aggregator.clone();
        let id = id.to_string();

        let submitted = self.access_pool.spawn_wait(async move {
            let owner = match durable.find_by_key(&id).await {
                Ok(Some(record)) => record.owner,
                Ok(None) => {
                    debug!(id = %id, "Access to unknown link ignored");
                    return;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Owner lookup failed, counting globally");
                    None
                }
            };
            aggregator.record_access(&id, owner.as_ref()).await;
        })
        .await;

        if let Err(reason) = &submitted {
            warn!(reason = %reason, "Access event dropped");
        }
        submitted
    }

    /// Links of `owner` with totals reconciled against unflushed accesses.
    pub async fn list_for_owner(&self, owner: &OwnerId) -> Result<Vec<TrackedRecord>> {
        let mut records = self.durable.find_by_owner(owner).await?;
        for record in &mut records {
            let delta = self.aggregator.pending_delta(&record.id).await;
            record.total += delta;
        }
        Ok(records)
    }

    /// Durable total plus unflushed accesses of one link.
    pub async fn reconciled_total(&self, id: &str) -> Result<Option<u64>> {
        let Some(record) = self.durable.find_by_key(id).await? else {
            return Ok(None);
        };
        Ok(Some(record.total + self.aggregator.pending_delta(id).await))
    }

    /// Top `limit` links of `scope`.
    pub async fn top(&self, scope: &RankingScope, limit: usize) -> Result<Vec<RankedItem>> {
        self.ranking.top_n(scope, limit).await
    }

    /// Wait for queued accesses and rebuilds to finish.
    pub async fn drain(&self) {
        self.access_pool.wait_idle().await;
        self.rebuild_pool.wait_idle().await;
    }

    /// Stop both background pools.
    pub async fn shutdown(&self) {
        self.access_pool.shutdown().await;
        self.rebuild_pool.shutdown().await;
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn aggregator(&self) -> &CounterAggregator {
        &self.aggregator
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    async fn prewarm(&self, record: &TrackedRecord) -> Result<()> {
        self.guard
            .put(LINK_CACHE_PREFIX, &record.id, &record.payload, self.settings.value_ttl)
            .await?;
        self.logical
            .put(LINK_HOT_PREFIX, &record.id, &record.payload, self.settings.logical_ttl)
            .await
    }
}
