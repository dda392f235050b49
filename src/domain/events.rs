//! Cache Events
//!
//! Immutable records of notable cache-tier occurrences. Events are emitted
//! through `tracing` as JSON so they can be shipped with the rest of the logs.
//!
//! # Example
//!
//! ```ignore
//! CacheEvent::TombstoneWritten {
//!     key: "link:cache:missing".to_string(),
//!     ttl_secs: 360,
//!     timestamp: Utc::now(),
//! }
//! .emit();
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Event representing a significant occurrence in the cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    // =========================================================================
    // Guard Events
    // =========================================================================
    /// A confirmed absence was cached.
    TombstoneWritten {
        key: String,
        ttl_secs: u64,
        timestamp: DateTime<Utc>,
    },

    /// A key was invalidated after an entity change.
    KeyInvalidated {
        key: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Rebuild Events
    // =========================================================================
    /// A stale envelope was rebuilt.
    RebuildCompleted {
        key: String,
        logical_expire_at: DateTime<Utc>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A rebuild failed; the stale envelope stays visible.
    RebuildFailed {
        key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Counter Events
    // =========================================================================
    /// Accumulated accesses were written to the record store.
    CounterFlushed {
        member: String,
        amount: u64,
        flush_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A cold ranking scope was warmed from the record store.
    RankingWarmed {
        scope: String,
        members: usize,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::TombstoneWritten { .. } => "TombstoneWritten",
            CacheEvent::KeyInvalidated { .. } => "KeyInvalidated",
            CacheEvent::RebuildCompleted { .. } => "RebuildCompleted",
            CacheEvent::RebuildFailed { .. } => "RebuildFailed",
            CacheEvent::CounterFlushed { .. } => "CounterFlushed",
            CacheEvent::RankingWarmed { .. } => "RankingWarmed",
        }
    }

    /// Log the event at debug level.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self));
        debug!(event_type = %self.event_type(), event = %json, "Cache event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CacheEvent::CounterFlushed {
            member: "abc123".into(),
            amount: 100,
            flush_id: "f-1".into(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "CounterFlushed");
        assert_eq!(json["amount"], 100);
        assert_eq!(event.event_type(), "CounterFlushed");
    }
}
