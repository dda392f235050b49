//! Cache tier configuration
//!
//! All TTLs, thresholds and pool sizes used by the guard, the logical cache
//! and the counter aggregator live in [`CacheSettings`]. Settings can be built
//! in code or loaded from a YAML file whose durations are Go-style strings:
//!
//! ```yaml
//! value_ttl: 24h
//! tombstone_base_ttl: 2m
//! logical_ttl: 30m
//! rebuild_lock_ttl: 10s
//! flush_threshold: 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Settings shared by every component of the cache tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// TTL for positive guard entries and write-time pre-warm
    #[serde(deserialize_with = "deserialize_duration")]
    pub value_ttl: Duration,

    /// Base TTL of a tombstone before the random multiplier
    #[serde(deserialize_with = "deserialize_duration")]
    pub tombstone_base_ttl: Duration,

    /// Upper bound (inclusive) of the tombstone TTL multiplier
    pub tombstone_max_multiplier: u32,

    /// Logical TTL written into stale-while-revalidate envelopes
    #[serde(deserialize_with = "deserialize_duration")]
    pub logical_ttl: Duration,

    /// Physical TTL of a rebuild lock
    #[serde(deserialize_with = "deserialize_duration")]
    pub rebuild_lock_ttl: Duration,

    /// Number of background workers executing stale-entry rebuilds
    pub rebuild_workers: usize,

    /// Bounded queue in front of the rebuild workers
    pub rebuild_queue_capacity: usize,

    /// Workers draining access events, separate from the rebuild workers
    pub access_workers: usize,

    /// Bounded queue of access events; submitters wait when it is full
    pub access_queue_capacity: usize,

    /// Counter value at which accumulated accesses are flushed durably
    pub flush_threshold: u64,

    /// Lease held while a member's flush is in flight
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_lease_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            value_ttl: Duration::from_secs(24 * 3600),
            tombstone_base_ttl: Duration::from_secs(2 * 60),
            tombstone_max_multiplier: 10,
            logical_ttl: Duration::from_secs(30 * 60),
            rebuild_lock_ttl: Duration::from_secs(10),
            rebuild_workers: 10,
            rebuild_queue_capacity: 1024,
            access_workers: 4,
            access_queue_capacity: 4096,
            flush_threshold: 100,
            flush_lease_ttl: Duration::from_secs(10),
        }
    }
}

impl CacheSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate settings from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate settings from a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let settings: CacheSettings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the components cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold == 0 {
            return Err(Error::Config("flush_threshold must be greater than 0".into()));
        }
        if self.tombstone_max_multiplier == 0 {
            return Err(Error::Config(
                "tombstone_max_multiplier must be greater than 0".into(),
            ));
        }
        if self.rebuild_workers == 0 {
            return Err(Error::Config("rebuild_workers must be greater than 0".into()));
        }
        if self.rebuild_queue_capacity == 0 {
            return Err(Error::Config(
                "rebuild_queue_capacity must be greater than 0".into(),
            ));
        }
        if self.access_workers == 0 || self.access_queue_capacity == 0 {
            return Err(Error::Config(
                "access_workers and access_queue_capacity must be greater than 0".into(),
            ));
        }
        if self.rebuild_lock_ttl.is_zero() || self.flush_lease_ttl.is_zero() {
            return Err(Error::Config("lock TTLs must be greater than 0".into()));
        }
        Ok(())
    }

    /// Set the positive entry TTL.
    pub fn with_value_ttl(mut self, ttl: Duration) -> Self {
        self.value_ttl = ttl;
        self
    }

    /// Set the tombstone base TTL and multiplier bound.
    pub fn with_tombstone_ttl(mut self, base: Duration, max_multiplier: u32) -> Self {
        self.tombstone_base_ttl = base;
        self.tombstone_max_multiplier = max_multiplier;
        self
    }

    /// Set the logical TTL.
    pub fn with_logical_ttl(mut self, ttl: Duration) -> Self {
        self.logical_ttl = ttl;
        self
    }

    /// Set the rebuild lock TTL.
    pub fn with_rebuild_lock_ttl(mut self, ttl: Duration) -> Self {
        self.rebuild_lock_ttl = ttl;
        self
    }

    /// Set the worker count and queue capacity of the rebuild pool.
    pub fn with_workers(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.rebuild_workers = workers;
        self.rebuild_queue_capacity = queue_capacity;
        self
    }

    /// Set the worker count and queue capacity of the access pool.
    pub fn with_access_workers(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.access_workers = workers;
        self.access_queue_capacity = queue_capacity;
        self
    }

    /// Set the counter flush threshold.
    pub fn with_flush_threshold(mut self, threshold: u64) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Randomized tombstone TTL: `base * U(1..=max_multiplier)`.
    pub fn tombstone_ttl(&self) -> Duration {
        let multiplier = fastrand::u32(1..=self.tombstone_max_multiplier.max(1));
        self.tombstone_base_ttl
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a Go-style duration string (e.g., "1h", "30m", "250ms", "1h30m")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if matches!(chars.peek(), Some('s') | Some('S')) => {
                chars.next();
                1
            }
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            'd' | 'D' => 86_400_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = num
            .checked_mul(multiplier)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
    }

    // Trailing number without a unit is seconds
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = num
            .checked_mul(1_000)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))?;
    }

    if total_ms == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_millis(total_ms))
}
