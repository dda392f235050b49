//! Key construction
//!
//! Every key the cache tier touches is built here so that the guard, the
//! logical cache and the counter aggregator always agree on the key for a
//! given dataset prefix and identifier.

use crate::domain::ports::RankingScope;

/// Dataset prefix for short-link payloads
pub const LINK_CACHE_PREFIX: &str = "link:cache:";

/// Dataset prefix for hot short links served stale-while-revalidate
pub const LINK_HOT_PREFIX: &str = "link:hot:";

/// Namespace of rebuild and flush locks
pub const LOCK_NAMESPACE: &str = "lock:";

/// Namespace of unflushed access counters
pub const COUNTER_NAMESPACE: &str = "counter:";

/// Namespace of in-flight flush records
pub const PENDING_FLUSH_NAMESPACE: &str = "flush:pending:";

/// Namespace of ranking sorted sets
pub const RANK_NAMESPACE: &str = "rank:";

/// Cache key - a dataset prefix concatenated with an entity identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    full: String,
    prefix_len: usize,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(prefix: &str, id: &str) -> Self {
        Self {
            full: format!("{}{}", prefix, id),
            prefix_len: prefix.len(),
        }
    }

    /// Full key as stored
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Dataset prefix
    #[inline]
    pub fn prefix(&self) -> &str {
        &self.full[..self.prefix_len]
    }

    /// Entity identifier
    #[inline]
    pub fn id(&self) -> &str {
        &self.full[self.prefix_len..]
    }

    /// Key of the lock guarding rebuilds of this key
    pub fn lock_key(&self) -> String {
        lock_key(&self.full)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

/// Lock key for any resource key
pub fn lock_key(resource: &str) -> String {
    format!("{}{}", LOCK_NAMESPACE, resource)
}

/// Unflushed access counter of a member
pub fn counter_key(member: &str) -> String {
    format!("{}{}", COUNTER_NAMESPACE, member)
}

/// In-flight flush record of a member
pub fn pending_flush_key(member: &str) -> String {
    format!("{}{}", PENDING_FLUSH_NAMESPACE, member)
}

/// Sorted set backing a ranking scope
pub fn ranking_key(scope: &RankingScope) -> String {
    match scope {
        RankingScope::Global => format!("{}global", RANK_NAMESPACE),
        RankingScope::Owner(owner) => format!("{}{}", RANK_NAMESPACE, owner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::OwnerId;

    #[test]
    fn test_cache_key_parts() {
        let key = CacheKey::new(LINK_CACHE_PREFIX, "abc123");

        assert_eq!(key.as_str(), "link:cache:abc123");
        assert_eq!(key.prefix(), "link:cache:");
        assert_eq!(key.id(), "abc123");
        assert_eq!(key.lock_key(), "lock:link:cache:abc123");
        assert_eq!(key.to_string(), "link:cache:abc123");
    }

    #[test]
    fn test_counter_and_ranking_keys() {
        assert_eq!(counter_key("abc123"), "counter:abc123");
        assert_eq!(pending_flush_key("abc123"), "flush:pending:abc123");
        assert_eq!(lock_key(&counter_key("abc123")), "lock:counter:abc123");
        assert_eq!(ranking_key(&RankingScope::Global), "rank:global");
        assert_eq!(
            ranking_key(&RankingScope::Owner(OwnerId::new("42"))),
            "rank:42"
        );
    }
}
