//! In-Memory Adapters
//!
//! [`InMemoryVolatileStore`] and [`InMemoryRecordStore`] implement the domain
//! ports without any external service. Both use DashMap so per-key
//! operations are atomic under concurrent access, mirroring the per-command
//! atomicity of a real store. Both accept injected faults for exercising the
//! error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::domain::ports::{OwnerId, RankingScope, RecordStore, TrackedRecord, VolatileStore};
use crate::error::{Error, Result};

// =============================================================================
// Volatile Store
// =============================================================================

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Sorted(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn text(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: StoredValue::Text(value.to_string()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// In-memory volatile store with physical TTLs and sorted sets.
#[derive(Debug, Default)]
pub struct InMemoryVolatileStore {
    entries: DashMap<String, StoredEntry>,
    unavailable: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryVolatileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`Error::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining physical TTL of a live key; `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries.get(key).and_then(|entry| {
            entry
                .expires_at
                .and_then(|deadline| deadline.checked_duration_since(Instant::now()))
        })
    }

    /// Number of read operations served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write operations served
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn record_read(&self) -> Result<()> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn record_write(&self) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn live_text(&self, key: &str) -> Result<Option<String>> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => match &entry.value {
                StoredValue::Text(value) => Ok(Some(value.clone())),
                StoredValue::Sorted(_) => Err(wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    fn add_to_counter(&self, key: &str, delta: i64) -> Result<i64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired() {
                    *entry = StoredEntry::text(&delta.to_string(), None);
                    return Ok(delta);
                }
                let current = match &entry.value {
                    StoredValue::Text(raw) => raw.parse::<i64>().map_err(|_| {
                        Error::StoreUnavailable(format!("value at {} is not an integer", key))
                    })?,
                    StoredValue::Sorted(_) => return Err(wrong_type(key)),
                };
                let updated = current + delta;
                entry.value = StoredValue::Text(updated.to_string());
                Ok(updated)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::text(&delta.to_string(), None));
                Ok(delta)
            }
        }
    }
}

fn wrong_type(key: &str) -> Error {
    Error::StoreUnavailable(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// Resolve Redis-style rank bounds (negative = from the end) to a slice range.
fn rank_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl VolatileStore for InMemoryVolatileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.record_read()?;
        self.live_text(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.record_write()?;
        self.entries
            .insert(key.to_string(), StoredEntry::text(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.record_write()?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredEntry::text(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::text(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.record_write()?;
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| !entry.is_expired())
            .unwrap_or(false))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.record_write()?;
        let removed = self.entries.remove_if(key, |_, entry| {
            !entry.is_expired()
                && matches!(&entry.value, StoredValue::Text(value) if value == expected)
        });
        Ok(removed.is_some())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.record_write()?;
        self.add_to_counter(key, delta)
    }

    async fn decrement(&self, key: &str, delta: i64) -> Result<i64> {
        self.record_write()?;
        self.add_to_counter(key, -delta)
    }

    async fn zincr_by(&self, set: &str, member: &str, delta: f64) -> Result<f64> {
        self.record_write()?;
        let mut entry = self.entries.entry(set.to_string()).or_insert_with(|| StoredEntry {
            value: StoredValue::Sorted(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            StoredValue::Sorted(members) => {
                let score = members.entry(member.to_string()).or_insert(0.0);
                *score += delta;
                Ok(*score)
            }
            StoredValue::Text(_) => Err(wrong_type(set)),
        }
    }

    async fn zrev_range_with_scores(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        self.record_read()?;
        let mut members: Vec<(String, f64)> = match self.entries.get(set) {
            Some(entry) => match &entry.value {
                StoredValue::Sorted(members) => members
                    .iter()
                    .map(|(member, score)| (member.clone(), *score))
                    .collect(),
                StoredValue::Text(_) => return Err(wrong_type(set)),
            },
            None => return Ok(Vec::new()),
        };

        // Descending score, ties in reverse lexicographic order as ZREVRANGE does
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        Ok(match rank_range(members.len(), start, stop) {
            Some((from, to)) => members[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()> {
        self.record_write()?;
        let mut entry = self.entries.entry(set.to_string()).or_insert_with(|| StoredEntry {
            value: StoredValue::Sorted(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            StoredValue::Sorted(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            StoredValue::Text(_) => Err(wrong_type(set)),
        }
    }

    async fn zscore(&self, set: &str, member: &str) -> Result<Option<f64>> {
        self.record_read()?;
        match self.entries.get(set) {
            Some(entry) => match &entry.value {
                StoredValue::Sorted(members) => Ok(members.get(member).copied()),
                StoredValue::Text(_) => Err(wrong_type(set)),
            },
            None => Ok(None),
        }
    }
}

// =============================================================================
// Record Store
// =============================================================================

/// In-memory record store that remembers applied flush ids.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<String, TrackedRecord>,
    applied_flushes: DashMap<String, u64>,
    /// Fail the next N counter increments without applying them
    failing_increments: AtomicU32,
    /// Apply the next N counter increments, then report failure
    ambiguous_increments: AtomicU32,
    unavailable: AtomicBool,
    find_calls: AtomicU64,
    increment_calls: AtomicU64,
    top_n_calls: AtomicU64,
}

impl InMemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = TrackedRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.id.clone(), record);
        }
        store
    }

    /// Fail the next `count` counter increments.
    pub fn fail_next_increments(&self, count: u32) {
        self.failing_increments.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` counter increments but report them as failed.
    pub fn ambiguous_next_increments(&self, count: u32) {
        self.ambiguous_increments.store(count, Ordering::SeqCst);
    }

    /// Make every lookup fail with [`Error::Durable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Durable total of a record.
    pub fn total(&self, id: &str) -> Option<u64> {
        self.records.get(id).map(|record| record.total)
    }

    /// Number of `find_by_key` calls
    pub fn find_calls(&self) -> u64 {
        self.find_calls.load(Ordering::SeqCst)
    }

    /// Number of counter increment calls, including failed ones
    pub fn increment_calls(&self) -> u64 {
        self.increment_calls.load(Ordering::SeqCst)
    }

    /// Number of top-N queries
    pub fn top_n_calls(&self) -> u64 {
        self.top_n_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Durable("record store marked unavailable".to_string()));
        }
        Ok(())
    }

    /// Take one unit from an injected-fault budget.
    fn take_fault(budget: &AtomicU32) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn add_to_total(&self, id: &str, delta: u64) -> u64 {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.total += delta;
                1
            }
            None => 0,
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find_by_key(&self, id: &str) -> Result<Option<TrackedRecord>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.records.get(id).map(|record| record.value().clone()))
    }

    async fn save(&self, record: TrackedRecord) -> Result<TrackedRecord> {
        self.check_available()?;
        self.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.records.remove(id).is_some())
    }

    async fn increment_counter_field(&self, id: &str, delta: u64) -> Result<u64> {
        self.increment_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        if Self::take_fault(&self.failing_increments) {
            return Err(Error::Durable(format!("injected failure incrementing {}", id)));
        }
        let rows = self.add_to_total(id, delta);
        if Self::take_fault(&self.ambiguous_increments) {
            return Err(Error::Durable(format!(
                "injected timeout after incrementing {}",
                id
            )));
        }
        Ok(rows)
    }

    async fn apply_flush(&self, id: &str, delta: u64, flush_id: &str) -> Result<u64> {
        if let Some(rows) = self.applied_flushes.get(flush_id) {
            self.increment_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(*rows);
        }

        self.increment_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        if Self::take_fault(&self.failing_increments) {
            return Err(Error::Durable(format!("injected failure incrementing {}", id)));
        }
        let rows = self.add_to_total(id, delta);
        if rows > 0 {
            self.applied_flushes.insert(flush_id.to_string(), rows);
        }
        if Self::take_fault(&self.ambiguous_increments) {
            return Err(Error::Durable(format!(
                "injected timeout after incrementing {}",
                id
            )));
        }
        Ok(rows)
    }

    async fn top_n_by_counter_field(
        &self,
        scope: &RankingScope,
        limit: usize,
    ) -> Result<Vec<TrackedRecord>> {
        self.top_n_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut records: Vec<TrackedRecord> = self
            .records
            .iter()
            .filter(|record| match scope {
                RankingScope::Global => true,
                RankingScope::Owner(owner) => record.owner.as_ref() == Some(owner),
            })
            .map(|record| record.value().clone())
            .collect();

        records.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.id.cmp(&b.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn find_by_owner(&self, owner: &OwnerId) -> Result<Vec<TrackedRecord>> {
        self.check_available()?;
        let mut records: Vec<TrackedRecord> = self
            .records
            .iter()
            .filter(|record| record.owner.as_ref() == Some(owner))
            .map(|record| record.value().clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_and_ttl_expiry() {
        let store = InMemoryVolatileStore::new();

        store.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert!(store.ttl("k").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_live_and_expired_keys() {
        let store = InMemoryVolatileStore::new();

        assert!(store.set_if_absent("lock", "a", Duration::from_millis(20)).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", Duration::from_millis(20)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.set_if_absent("lock", "c", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some("c".to_string()));
    }

    #[tokio::test]
    async fn test_delete_if_equals_checks_value() {
        let store = InMemoryVolatileStore::new();
        store.set("lock", "token-1", None).await.unwrap();

        assert!(!store.delete_if_equals("lock", "token-2").await.unwrap());
        assert!(store.delete_if_equals("lock", "token-1").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let store = InMemoryVolatileStore::new();

        assert_eq!(store.increment("c", 1).await.unwrap(), 1);
        assert_eq!(store.increment("c", 4).await.unwrap(), 5);
        assert_eq!(store.decrement("c", 2).await.unwrap(), 3);

        store.set("text", "abc", None).await.unwrap();
        assert!(store.increment("text", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_ranges() {
        let store = InMemoryVolatileStore::new();
        store.zincr_by("rank", "a", 3.0).await.unwrap();
        store.zincr_by("rank", "b", 5.0).await.unwrap();
        store.zadd("rank", "c", 1.0).await.unwrap();
        store.zincr_by("rank", "a", 1.0).await.unwrap();

        let all = store.zrev_range_with_scores("rank", 0, -1).await.unwrap();
        assert_eq!(
            all,
            vec![
                ("b".to_string(), 5.0),
                ("a".to_string(), 4.0),
                ("c".to_string(), 1.0)
            ]
        );

        let top = store.zrev_range_with_scores("rank", 0, 0).await.unwrap();
        assert_eq!(top, vec![("b".to_string(), 5.0)]);
        assert!(store
            .zrev_range_with_scores("missing", 0, 9)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.zscore("rank", "a").await.unwrap(), Some(4.0));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryVolatileStore::new();
        store.set_unavailable(true);

        assert!(store.get("k").await.unwrap_err().is_store_unavailable());
        assert!(store.increment("k", 1).await.is_err());

        store.set_unavailable(false);
        assert!(store.get("k").await.is_ok());
    }

    #[test]
    fn test_rank_range() {
        assert_eq!(rank_range(5, 0, -1), Some((0, 4)));
        assert_eq!(rank_range(5, 0, 9), Some((0, 4)));
        assert_eq!(rank_range(5, -2, -1), Some((3, 4)));
        assert_eq!(rank_range(0, 0, 9), None);
        assert_eq!(rank_range(5, 6, 9), None);
    }

    #[tokio::test]
    async fn test_record_store_top_n_by_scope() {
        let store = InMemoryRecordStore::with_records(vec![
            TrackedRecord::new("a", "https://a").with_owner("1").with_total(10),
            TrackedRecord::new("b", "https://b").with_owner("2").with_total(30),
            TrackedRecord::new("c", "https://c").with_owner("1").with_total(20),
        ]);

        let global = store
            .top_n_by_counter_field(&RankingScope::Global, 2)
            .await
            .unwrap();
        assert_eq!(
            global.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );

        let owned = store
            .top_n_by_counter_field(&RankingScope::Owner(OwnerId::new("1")), 10)
            .await
            .unwrap();
        assert_eq!(
            owned.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["c", "a"]
        );
    }

    #[tokio::test]
    async fn test_apply_flush_is_idempotent_per_id() {
        let store =
            InMemoryRecordStore::with_records(vec![TrackedRecord::new("a", "https://a")]);

        assert_eq!(store.apply_flush("a", 100, "f-1").await.unwrap(), 1);
        assert_eq!(store.apply_flush("a", 100, "f-1").await.unwrap(), 1);
        assert_eq!(store.total("a"), Some(100));

        assert_eq!(store.apply_flush("missing", 100, "f-2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_increment_faults() {
        let store =
            InMemoryRecordStore::with_records(vec![TrackedRecord::new("a", "https://a")]);

        store.fail_next_increments(1);
        assert!(store.increment_counter_field("a", 5).await.is_err());
        assert_eq!(store.total("a"), Some(0));

        store.ambiguous_next_increments(1);
        assert!(store.increment_counter_field("a", 5).await.is_err());
        assert_eq!(store.total("a"), Some(5));

        assert_eq!(store.increment_counter_field("a", 5).await.unwrap(), 1);
        assert_eq!(store.total("a"), Some(10));
        assert_eq!(store.increment_calls(), 3);
    }
}
