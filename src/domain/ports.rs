//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! The cache tier depends on exactly two collaborators, both injected as
//! trait objects so production adapters and in-memory fakes are
//! interchangeable:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Cache Tier                              │
//! │   NegativeCacheGuard │ LogicalCache │ CounterAggregator     │
//! │                      RankingReader                           │
//! └─────────────────────────────────────────────────────────────┘
//!               │                              │
//!               ▼                              ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │  VolatileStore (port)    │   │  RecordStore (port)          │
//! │  Redis │ InMemory        │   │  SQL │ InMemory              │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Owner identifier (value object).
///
/// The id `global` is reserved: its ranking set would be `rank:global`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Scope of a ranking view.
///
/// Every access updates [`RankingScope::Global`]; accesses whose owner is
/// known also update that owner's scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RankingScope {
    Global,
    Owner(OwnerId),
}

impl RankingScope {
    /// Scopes an access by `owner` belongs to.
    pub fn for_access(owner: Option<&OwnerId>) -> Vec<RankingScope> {
        let mut scopes = vec![RankingScope::Global];
        if let Some(owner) = owner {
            scopes.push(RankingScope::Owner(owner.clone()));
        }
        scopes
    }
}

impl std::str::FromStr for RankingScope {
    type Err = Error;

    /// Parse `global` or `owner:<id>`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "global" => Ok(RankingScope::Global),
            other => match other.strip_prefix("owner:") {
                Some(owner) if !owner.is_empty() => Ok(RankingScope::Owner(OwnerId::new(owner))),
                _ => Err(Error::Config(format!(
                    "invalid ranking scope '{}', expected 'global' or 'owner:<id>'",
                    s
                ))),
            },
        }
    }
}

impl std::fmt::Display for RankingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RankingScope::Global => write!(f, "global"),
            RankingScope::Owner(owner) => write!(f, "owner:{}", owner),
        }
    }
}

/// A durable record tracked by the cache tier: a short code mapped to its
/// long-form payload, plus the durable access total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRecord {
    /// Member identifier (short code)
    pub id: String,
    /// Owner, when the record belongs to one
    pub owner: Option<OwnerId>,
    /// Long-form payload (target URL)
    pub payload: String,
    /// Durable access total
    pub total: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl TrackedRecord {
    /// Create a record with a zero total.
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: None,
            payload: payload.into(),
            total: 0,
            created_at: Utc::now(),
        }
    }

    /// Attach an owner.
    pub fn with_owner(mut self, owner: impl Into<OwnerId>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the durable total.
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = total;
        self
    }
}

// =============================================================================
// Volatile Store Port
// =============================================================================

/// Port for the shared, network-accessible key-value / sorted-set store.
///
/// Each method maps onto one atomic primitive of the store. Sequences of
/// calls are not atomic.
#[async_trait]
pub trait VolatileStore: Send + Sync {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string value, optionally with a physical TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write only if the key is absent. Returns true when written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns true when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete a key only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Atomically add `delta`, returning the new value.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Atomically subtract `delta`, returning the new value.
    async fn decrement(&self, key: &str, delta: i64) -> Result<i64>;

    /// Atomically add `delta` to a sorted-set member's score.
    async fn zincr_by(&self, set: &str, member: &str, delta: f64) -> Result<f64>;

    /// Members in descending score order between ranks `start..=stop`.
    async fn zrev_range_with_scores(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;

    /// Set a sorted-set member's score.
    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<()>;

    /// Score of a sorted-set member.
    async fn zscore(&self, set: &str, member: &str) -> Result<Option<f64>>;
}

// =============================================================================
// Record Store Port
// =============================================================================

/// Port for the durable record store, the source of truth.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Look up a record by member id.
    async fn find_by_key(&self, id: &str) -> Result<Option<TrackedRecord>>;

    /// Insert or replace a record.
    async fn save(&self, record: TrackedRecord) -> Result<TrackedRecord>;

    /// Delete a record. Returns true when a record was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Add `delta` to a record's total. Returns the number of rows affected.
    async fn increment_counter_field(&self, id: &str, delta: u64) -> Result<u64>;

    /// Apply a counter flush identified by `flush_id`.
    ///
    /// Stores that can remember applied flush ids should apply each id at
    /// most once and report it as affected on replay. The default forwards to
    /// [`RecordStore::increment_counter_field`].
    async fn apply_flush(&self, id: &str, delta: u64, _flush_id: &str) -> Result<u64> {
        self.increment_counter_field(id, delta).await
    }

    /// Records of `scope` ordered by descending total.
    async fn top_n_by_counter_field(
        &self,
        scope: &RankingScope,
        limit: usize,
    ) -> Result<Vec<TrackedRecord>>;

    /// All records belonging to `owner`.
    async fn find_by_owner(&self, owner: &OwnerId) -> Result<Vec<TrackedRecord>>;
}
