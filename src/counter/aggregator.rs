//! Counter Aggregator
//!
//! Access events are counted in the volatile store and written to the record
//! store in batches. Each access bumps the member's unflushed counter and
//! its score in every ranking scope it belongs to. When the counter lands
//! on a multiple of the flush threshold, the accumulated amount is flushed.
//!
//! # Flush protocol
//!
//! ```text
//!   lease  lock:counter:<m>                    (one flusher per member)
//!   replay a leftover flush:pending:<m>, if any, with its own flush_id
//!   read   counter:<m> as amount
//!   write  flush:pending:<m> = {flush_id, amount}
//!   apply  record_store.apply_flush(m, amount, flush_id)
//!   ok  →  delete_if_equals(pending) → decrement counter by amount, floor 0
//!   err →  keep pending; the next trigger replays the same flush_id
//! ```
//!
//! A replay is followed by a fresh flush of whatever accumulated since the
//! failed attempt, so one successful trigger catches the record store up.
//!
//! Replaying a flush id lets a store that remembers applied ids absorb an
//! ambiguous failure (applied, but reported as failed) without counting the
//! amount twice. The counter is decremented only by the caller that removed
//! the pending record, so a flush is subtracted at most once.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::executor::{SubmitError, TaskPool};
use crate::cache::keys::{counter_key, lock_key, pending_flush_key, ranking_key};
use crate::cache::lock::{LockLease, LockManager};
use crate::cache::metrics::CacheMetrics;
use crate::config::CacheSettings;
use crate::domain::events::CacheEvent;
use crate::domain::ports::{OwnerId, RankingScope, RecordStore, VolatileStore};
use crate::error::{Error, Result};

/// Flush in flight for a member, stored until the record store confirms it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFlush {
    pub flush_id: String,
    pub amount: u64,
}

impl PendingFlush {
    fn new(amount: u64) -> Self {
        Self {
            flush_id: Uuid::new_v4().to_string(),
            amount,
        }
    }
}

/// What a flush attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Counter not on a threshold multiple
    NotDue,
    /// Amount written to the record store and subtracted from the counter
    Flushed { amount: u64, flush_id: String },
    /// Another caller holds the member's flush lease
    Deferred,
    /// Left for the next trigger to retry
    Failed,
}

/// Result of recording one access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessOutcome {
    /// Counter value after this access; `None` when the store was unreachable
    pub counter: Option<i64>,
    pub flush: FlushOutcome,
}

/// Write-behind access counter with live rankings.
#[derive(Clone)]
pub struct CounterAggregator {
    store: Arc<dyn VolatileStore>,
    durable: Arc<dyn RecordStore>,
    locks: LockManager,
    access_pool: Arc<TaskPool>,
    settings: CacheSettings,
    metrics: Arc<CacheMetrics>,
}

impl CounterAggregator {
    pub fn new(
        store: Arc<dyn VolatileStore>,
        durable: Arc<dyn RecordStore>,
        access_pool: Arc<TaskPool>,
        settings: CacheSettings,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            locks: LockManager::new(store.clone()),
            store,
            durable,
            access_pool,
            settings,
            metrics,
        }
    }

    /// Record one access of `member`, flushing when the threshold is reached.
    ///
    /// Never fails: store errors are logged and the access is dropped from
    /// the cache tier, flush errors leave the counter for the next trigger.
    #[instrument(skip(self))]
    pub async fn record_access(&self, member: &str, owner: Option<&OwnerId>) -> AccessOutcome {
        let counter = match self.store.increment(&counter_key(member), 1).await {
            Ok(value) => Some(value),
            Err(e) => {
                self.metrics.record_store_error();
                warn!(member = %member, error = %e, "Failed to increment access counter");
                None
            }
        };

        for scope in RankingScope::for_access(owner) {
            if let Err(e) = self.store.zincr_by(&ranking_key(&scope), member, 1.0).await {
                self.metrics.record_store_error();
                warn!(member = %member, scope = %scope, error = %e, "Failed to update ranking");
            }
        }

        let flush = match counter {
            Some(value) if self.is_flush_due(value) => self.flush(member).await,
            _ => FlushOutcome::NotDue,
        };

        AccessOutcome { counter, flush }
    }

    /// Queue [`CounterAggregator::record_access`] on the access pool.
    ///
    /// Waits for queue space instead of dropping the event; fails only once
    /// the pool has shut down.
    pub async fn submit_access(
        &self,
        member: &str,
        owner: Option<OwnerId>,
    ) -> std::result::Result<(), SubmitError> {
        let aggregator = self.clone();
        let member = member.to_string();
        let submitted = self
            .access_pool
            .spawn_wait(async move {
                aggregator.record_access(&member, owner.as_ref()).await;
            })
            .await;
        if let Err(reason) = &submitted {
            warn!(reason = %reason, "Access event dropped");
        }
        submitted
    }

    /// Accesses counted in the cache tier but not yet in the record store.
    ///
    /// Store failures read as zero.
    pub async fn pending_delta(&self, member: &str) -> u64 {
        match self.read_counter(member).await {
            Ok(value) => value.max(0) as u64,
            Err(e) => {
                self.metrics.record_store_error();
                warn!(member = %member, error = %e, "Failed to read access counter");
                0
            }
        }
    }

    async fn read_counter(&self, member: &str) -> Result<i64> {
        match self.store.get(&counter_key(member)).await? {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                Error::Decode(format!("access counter of {} is not an integer: {}", member, raw))
            }),
            None => Ok(0),
        }
    }

    fn is_flush_due(&self, counter: i64) -> bool {
        counter > 0 && (counter as u64) % self.settings.flush_threshold == 0
    }

    async fn flush(&self, member: &str) -> FlushOutcome {
        let lease = match self
            .locks
            .try_acquire(&lock_key(&counter_key(member)), self.settings.flush_lease_ttl)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(member = %member, "Flush already in flight");
                return FlushOutcome::Deferred;
            }
            Err(e) => {
                self.metrics.record_flush_failure();
                warn!(member = %member, error = %e, "Flush lease unavailable");
                return FlushOutcome::Failed;
            }
        };

        let outcome = match self.flush_under_lease(member).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_flush_failure();
                warn!(member = %member, error = %e, "Flush failed, will retry on next trigger");
                FlushOutcome::Failed
            }
        };

        self.release(&lease).await;
        outcome
    }

    async fn flush_under_lease(&self, member: &str) -> Result<FlushOutcome> {
        let pending_key = pending_flush_key(member);
        let mut flushed: Option<(u64, String)> = None;

        if let Some((pending, stored)) = self.leftover_flush(&pending_key).await? {
            info!(
                member = %member,
                flush_id = %pending.flush_id,
                amount = pending.amount,
                "Replaying unconfirmed flush"
            );
            if !self.apply_pending(member, &pending_key, &pending, &stored).await? {
                return Ok(FlushOutcome::Failed);
            }
            flushed = Some((pending.amount, pending.flush_id));
        }

        match self.flush_accumulated(member, &pending_key).await {
            Ok(Some((amount, flush_id))) => {
                let total = flushed.map_or(0, |(replayed, _)| replayed) + amount;
                flushed = Some((total, flush_id));
            }
            Ok(None) => {}
            // The replay already landed; the new pending record is retried later
            Err(e) if flushed.is_some() => {
                self.metrics.record_flush_failure();
                warn!(member = %member, error = %e, "Flush after replay failed, will retry");
            }
            Err(e) => return Err(e),
        }

        Ok(match flushed {
            Some((amount, flush_id)) => FlushOutcome::Flushed { amount, flush_id },
            None => FlushOutcome::NotDue,
        })
    }

    /// Flush the counter as it stands under the lease. Returns the amount
    /// and flush id when something was flushed.
    async fn flush_accumulated(
        &self,
        member: &str,
        pending_key: &str,
    ) -> Result<Option<(u64, String)>> {
        // Read under the lease: only lease holders decrement, so the
        // counter cannot drop below this before our decrement lands
        let amount = self.read_counter(member).await?.max(0) as u64;
        if amount == 0 {
            return Ok(None);
        }
        let pending = PendingFlush::new(amount);
        let stored = serde_json::to_string(&pending)?;
        self.store.set(pending_key, &stored, None).await?;

        if self.apply_pending(member, pending_key, &pending, &stored).await? {
            Ok(Some((pending.amount, pending.flush_id)))
        } else {
            Ok(None)
        }
    }

    /// Send one pending flush to the record store and retire it. Returns
    /// false when the record is missing and the flush stays pending.
    async fn apply_pending(
        &self,
        member: &str,
        pending_key: &str,
        pending: &PendingFlush,
        stored: &str,
    ) -> Result<bool> {
        let rows = self
            .durable
            .apply_flush(member, pending.amount, &pending.flush_id)
            .await?;
        if rows == 0 {
            self.metrics.record_flush_failure();
            warn!(member = %member, "Record missing, flush kept for retry");
            return Ok(false);
        }

        if self.store.delete_if_equals(pending_key, stored).await? {
            self.subtract(member, pending.amount).await?;
        }

        self.metrics.record_flush();
        info!(member = %member, amount = pending.amount, "Flushed access counter");
        CacheEvent::CounterFlushed {
            member: member.to_string(),
            amount: pending.amount,
            flush_id: pending.flush_id.clone(),
            timestamp: Utc::now(),
        }
        .emit();
        Ok(true)
    }

    /// Pending record left by an earlier failed flush, with its stored text.
    async fn leftover_flush(&self, pending_key: &str) -> Result<Option<(PendingFlush, String)>> {
        let Some(stored) = self.store.get(pending_key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<PendingFlush>(&stored) {
            Ok(pending) => Ok(Some((pending, stored))),
            Err(e) => {
                warn!(key = %pending_key, error = %e, "Discarding unreadable pending flush");
                self.store.delete_if_equals(pending_key, &stored).await?;
                Ok(None)
            }
        }
    }

    /// Subtract a confirmed flush from the counter, never leaving it negative.
    async fn subtract(&self, member: &str, amount: u64) -> Result<()> {
        let key = counter_key(member);
        let remaining = self.store.decrement(&key, amount as i64).await?;
        if remaining < 0 {
            self.store.increment(&key, -remaining).await?;
        }
        Ok(())
    }

    async fn release(&self, lease: &LockLease) {
        self.locks.release(lease).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryRecordStore, InMemoryVolatileStore};
    use crate::domain::ports::TrackedRecord;
    use assert_matches::assert_matches;

    struct Fixture {
        store: Arc<InMemoryVolatileStore>,
        durable: Arc<InMemoryRecordStore>,
        pool: Arc<TaskPool>,
        aggregator: CounterAggregator,
    }

    fn fixture(threshold: u64) -> Fixture {
        let store = Arc::new(InMemoryVolatileStore::new());
        let durable = Arc::new(InMemoryRecordStore::with_records([
            TrackedRecord::new("abc123", "https://example.com/a"),
            TrackedRecord::new("owned", "https://example.com/o").with_owner("7"),
        ]));
        let pool = Arc::new(TaskPool::new(2, 64).unwrap());
        let aggregator = CounterAggregator::new(
            store.clone(),
            durable.clone(),
            pool.clone(),
            CacheSettings::default().with_flush_threshold(threshold),
            Arc::new(CacheMetrics::new()),
        );
        Fixture {
            store,
            durable,
            pool,
            aggregator,
        }
    }

    async fn counter(store: &InMemoryVolatileStore, member: &str) -> Option<String> {
        store.get(&counter_key(member)).await.unwrap()
    }

    #[tokio::test]
    async fn test_exact_threshold_flushes_once() {
        let f = fixture(10);

        for i in 1..=10 {
            let outcome = f.aggregator.record_access("abc123", None).await;
            assert_eq!(outcome.counter, Some(i));
            if i < 10 {
                assert_eq!(outcome.flush, FlushOutcome::NotDue);
            } else {
                assert_matches!(outcome.flush, FlushOutcome::Flushed { amount: 10, .. });
            }
        }

        assert_eq!(f.durable.total("abc123"), Some(10));
        assert_eq!(f.durable.increment_calls(), 1);
        assert_eq!(counter(&f.store, "abc123").await.as_deref(), Some("0"));
        assert!(f.store.get("flush:pending:abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remainder_stays_in_counter() {
        let f = fixture(10);
        for _ in 0..13 {
            f.aggregator.record_access("abc123", None).await;
        }

        assert_eq!(f.durable.total("abc123"), Some(10));
        assert_eq!(f.aggregator.pending_delta("abc123").await, 3);
    }

    #[tokio::test]
    async fn test_owner_scope_updates_both_rankings() {
        let f = fixture(100);
        let owner = OwnerId::new("7");
        for _ in 0..3 {
            f.aggregator.record_access("owned", Some(&owner)).await;
        }

        assert_eq!(f.store.zscore("rank:global", "owned").await.unwrap(), Some(3.0));
        assert_eq!(f.store.zscore("rank:7", "owned").await.unwrap(), Some(3.0));
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried_with_same_id() {
        let f = fixture(10);
        f.durable.fail_next_increments(1);

        for _ in 0..10 {
            f.aggregator.record_access("abc123", None).await;
        }
        assert_eq!(f.durable.total("abc123"), Some(0));
        assert_eq!(f.aggregator.pending_delta("abc123").await, 10);
        let leftover: PendingFlush = serde_json::from_str(
            &f.store.get("flush:pending:abc123").await.unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(leftover.amount, 10);

        for _ in 0..10 {
            f.aggregator.record_access("abc123", None).await;
        }

        // Replay of the leftover flush plus everything counted since
        assert_eq!(f.durable.total("abc123"), Some(20));
        assert_eq!(f.aggregator.pending_delta("abc123").await, 0);
        assert!(f.store.get("flush:pending:abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_flush_is_not_double_counted() {
        let f = fixture(10);
        f.durable.ambiguous_next_increments(1);

        for _ in 0..10 {
            f.aggregator.record_access("abc123", None).await;
        }
        // Applied durably but reported as failed
        assert_eq!(f.durable.total("abc123"), Some(10));
        assert_eq!(f.aggregator.pending_delta("abc123").await, 10);

        for _ in 0..9 {
            f.aggregator.record_access("abc123", None).await;
        }
        let outcome = f.aggregator.record_access("abc123", None).await;

        // The replay is absorbed, only the ten new accesses are added
        assert_matches!(outcome.flush, FlushOutcome::Flushed { amount: 20, .. });
        assert_eq!(f.durable.total("abc123"), Some(20));
        assert_eq!(f.aggregator.pending_delta("abc123").await, 0);
    }

    #[tokio::test]
    async fn test_held_lease_defers_flush() {
        let f = fixture(2);
        f.store
            .set_if_absent("lock:counter:abc123", "other", std::time::Duration::from_secs(5))
            .await
            .unwrap();

        f.aggregator.record_access("abc123", None).await;
        let outcome = f.aggregator.record_access("abc123", None).await;

        assert_eq!(outcome.flush, FlushOutcome::Deferred);
        assert_eq!(f.durable.total("abc123"), Some(0));
        assert_eq!(f.aggregator.pending_delta("abc123").await, 2);
    }

    #[tokio::test]
    async fn test_store_outage_drops_access_silently() {
        let f = fixture(10);
        f.store.set_unavailable(true);

        let outcome = f.aggregator.record_access("abc123", None).await;
        assert_eq!(outcome.counter, None);
        assert_eq!(outcome.flush, FlushOutcome::NotDue);
        assert_eq!(f.aggregator.pending_delta("abc123").await, 0);
    }

    #[tokio::test]
    async fn test_submitted_accesses_run_in_background() {
        let f = fixture(100);
        for _ in 0..5 {
            f.aggregator.submit_access("abc123", None).await.unwrap();
        }
        f.pool.wait_idle().await;

        assert_eq!(f.aggregator.pending_delta("abc123").await, 5);
        assert_eq!(f.store.zscore("rank:global", "abc123").await.unwrap(), Some(5.0));
    }

    #[tokio::test]
    async fn test_full_access_queue_waits_instead_of_dropping() {
        let store = Arc::new(InMemoryVolatileStore::new());
        let durable = Arc::new(InMemoryRecordStore::with_records([TrackedRecord::new(
            "abc123",
            "https://example.com/a",
        )]));
        let pool = Arc::new(TaskPool::new(1, 2).unwrap());
        let aggregator = CounterAggregator::new(
            store.clone(),
            durable.clone(),
            pool.clone(),
            CacheSettings::default().with_flush_threshold(10),
            Arc::new(CacheMetrics::new()),
        );

        for _ in 0..50 {
            aggregator.submit_access("abc123", None).await.unwrap();
        }
        pool.wait_idle().await;

        let flushed = durable.total("abc123").unwrap();
        assert_eq!(flushed + aggregator.pending_delta("abc123").await, 50);
        assert_eq!(store.zscore("rank:global", "abc123").await.unwrap(), Some(50.0));
    }
}
