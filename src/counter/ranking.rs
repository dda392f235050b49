//! Ranking Reader
//!
//! Top-N queries over the per-scope sorted sets maintained by the
//! [`super::CounterAggregator`]. A cold scope (empty set) is answered from
//! the record store and warmed with each member's durable total, so the
//! next query for that scope stays in the cache tier. Payloads are resolved
//! through the [`NegativeCacheGuard`], never by direct record-store reads.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cache::guard::NegativeCacheGuard;
use crate::cache::keys::{ranking_key, LINK_CACHE_PREFIX};
use crate::cache::metrics::CacheMetrics;
use crate::config::CacheSettings;
use crate::domain::events::CacheEvent;
use crate::domain::ports::{RankingScope, RecordStore, VolatileStore};
use crate::error::{Error, Result};

/// One row of a ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedItem {
    pub member_id: String,
    pub score: u64,
    /// Long-form payload; `None` when the record no longer exists
    pub payload: Option<String>,
}

/// Serves top-N rankings per scope.
#[derive(Clone)]
pub struct RankingReader {
    store: Arc<dyn VolatileStore>,
    durable: Arc<dyn RecordStore>,
    guard: NegativeCacheGuard,
    settings: CacheSettings,
    metrics: Arc<CacheMetrics>,
}

impl RankingReader {
    pub fn new(
        store: Arc<dyn VolatileStore>,
        durable: Arc<dyn RecordStore>,
        guard: NegativeCacheGuard,
        settings: CacheSettings,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            store,
            durable,
            guard,
            settings,
            metrics,
        }
    }

    /// Top `limit` members of `scope` by descending score.
    ///
    /// Fails only when a cold scope or a payload miss needs the record store
    /// and the record store fails.
    #[instrument(skip(self))]
    pub async fn top_n(&self, scope: &RankingScope, limit: usize) -> Result<Vec<RankedItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let set = ranking_key(scope);

        let cached = match self
            .store
            .zrev_range_with_scores(&set, 0, isize::try_from(limit).unwrap_or(isize::MAX) - 1)
            .await
        {
            Ok(members) => members,
            Err(e) => {
                self.metrics.record_store_error();
                warn!(scope = %scope, error = %e, "Ranking read failed, using record store");
                Vec::new()
            }
        };

        let entries: Vec<(String, u64)> = if cached.is_empty() {
            self.warm(scope, &set, limit).await?
        } else {
            debug!(scope = %scope, members = cached.len(), "Ranking served from cache");
            cached
                .into_iter()
                .map(|(member, score)| (member, score.max(0.0).round() as u64))
                .collect()
        };

        try_join_all(entries.into_iter().map(|(member_id, score)| async move {
            let payload = self.resolve_payload(&member_id).await?;
            Ok::<_, Error>(RankedItem {
                member_id,
                score,
                payload,
            })
        }))
        .await
    }

    /// Load a cold scope from the record store and seed its sorted set.
    async fn warm(&self, scope: &RankingScope, set: &str, limit: usize) -> Result<Vec<(String, u64)>> {
        let records = self.durable.top_n_by_counter_field(scope, limit).await?;

        for record in &records {
            if let Err(e) = self.store.zadd(set, &record.id, record.total as f64).await {
                self.metrics.record_store_error();
                warn!(scope = %scope, member = %record.id, error = %e, "Failed to warm ranking entry");
            }
            self.guard
                .put(LINK_CACHE_PREFIX, &record.id, &record.payload, self.settings.value_ttl)
                .await?;
        }

        self.metrics.record_ranking_warm();
        info!(scope = %scope, members = records.len(), "Warmed cold ranking");
        CacheEvent::RankingWarmed {
            scope: scope.to_string(),
            members: records.len(),
            timestamp: Utc::now(),
        }
        .emit();

        let mut entries: Vec<(String, u64)> = records
            .into_iter()
            .map(|record| (record.id, record.total))
            .collect();
        // Same order the warmed set will report
        entries.sort_by(|a, b| match b.1.cmp(&a.1) {
            Ordering::Equal => b.0.cmp(&a.0),
            other => other,
        });
        Ok(entries)
    }

    async fn resolve_payload(&self, member_id: &str) -> Result<Option<String>> {
        let durable = self.durable.clone();
        self.guard
            .get(
                LINK_CACHE_PREFIX,
                member_id,
                |id| async move {
                    let record = durable.find_by_key(&id).await?;
                    Ok::<_, Error>(record.map(|record| record.payload))
                },
                self.settings.value_ttl,
            )
            .await
    }
}
