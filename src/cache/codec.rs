//! Payload codec
//!
//! Values are stored as JSON text. A reader declares the shape it expects
//! through [`CachePayload::SHAPE`]: structured readers fail on undecodable
//! text, while text readers fall back to the raw stored string, so values
//! written by producers that never JSON-encoded them stay readable.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::ports::TrackedRecord;
use crate::error::{Error, Result};

/// Sentinel cached for a confirmed absence in the record store.
pub const TOMBSTONE: &str = "";

/// Shape a reader expects a cached payload to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// JSON-encoded value; undecodable text is an error
    Structured,
    /// Plain text; undecodable text is returned as stored
    Text,
}

/// A value that can be stored in the cache tier.
pub trait CachePayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Shape expected when reading this type back
    const SHAPE: PayloadShape = PayloadShape::Structured;

    /// Build a value from raw, non-JSON text.
    fn from_raw(_raw: String) -> Option<Self> {
        None
    }
}

impl CachePayload for String {
    const SHAPE: PayloadShape = PayloadShape::Text;

    fn from_raw(raw: String) -> Option<Self> {
        Some(raw)
    }
}

impl CachePayload for u64 {}
impl CachePayload for i64 {}
impl CachePayload for serde_json::Value {}
impl CachePayload for TrackedRecord {}

/// Result of decoding a stored payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue<T> {
    /// Payload decoded as JSON
    Structured(T),
    /// Payload kept as the raw stored text
    Raw(String),
}

impl<T: CachePayload> DecodedValue<T> {
    /// Collapse into the caller's type.
    pub fn into_value(self) -> Option<T> {
        match self {
            DecodedValue::Structured(value) => Some(value),
            DecodedValue::Raw(raw) => T::from_raw(raw),
        }
    }
}

/// Encode a payload for storage.
pub fn encode<T: CachePayload>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a stored payload according to `T::SHAPE`.
pub fn decode<T: CachePayload>(raw: &str) -> Result<DecodedValue<T>> {
    match serde_json::from_str::<T>(raw) {
        Ok(value) => Ok(DecodedValue::Structured(value)),
        Err(e) => match T::SHAPE {
            PayloadShape::Text => Ok(DecodedValue::Raw(raw.to_string())),
            PayloadShape::Structured => Err(Error::Decode(e.to_string())),
        },
    }
}

/// Decode straight into the caller's type.
pub fn decode_value<T: CachePayload>(raw: &str) -> Result<T> {
    decode::<T>(raw)?
        .into_value()
        .ok_or_else(|| Error::Decode(format!("raw payload not accepted: {}", raw)))
}

// =============================================================================
// Logical Envelope
// =============================================================================

/// Payload wrapped with an application-level expiry.
///
/// Stored without a physical TTL; staleness is decided only by comparing
/// `logical_expire_at` with the current time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalEnvelope {
    /// Encoded payload
    pub payload: String,
    /// Instant after which the payload is stale
    pub logical_expire_at: DateTime<Utc>,
}

impl LogicalEnvelope {
    /// Wrap an encoded payload expiring `ttl` from now.
    pub fn new(payload: String, ttl: Duration) -> Result<Self> {
        Ok(Self {
            payload,
            logical_expire_at: expiry_after(Utc::now(), ttl)?,
        })
    }

    /// Wrap an encoded payload replacing `previous`.
    ///
    /// The new expiry is strictly later than the previous one even when the
    /// clock has not advanced.
    pub fn renewed(payload: String, ttl: Duration, previous: Option<&LogicalEnvelope>) -> Result<Self> {
        let mut logical_expire_at = expiry_after(Utc::now(), ttl)?;
        if let Some(previous) = previous {
            let floor = previous.logical_expire_at + chrono::Duration::milliseconds(1);
            if logical_expire_at < floor {
                logical_expire_at = floor;
            }
        }
        Ok(Self {
            payload,
            logical_expire_at,
        })
    }

    /// True while the expiry is in the future.
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    /// True while the expiry is after `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.logical_expire_at > now
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored envelope.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Decode(format!("invalid envelope: {}", e)))
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::Config(format!("logical TTL out of range: {}", e)))?;
    now.checked_add_signed(ttl)
        .ok_or_else(|| Error::Config("logical TTL overflows the clock".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    impl CachePayload for Profile {}

    #[test]
    fn test_text_reader_falls_back_to_raw() {
        assert_matches!(
            decode::<String>("https://example.com/plain"),
            Ok(DecodedValue::Raw(raw)) if raw == "https://example.com/plain"
        );
        assert_matches!(
            decode::<String>("\"https://example.com/json\""),
            Ok(DecodedValue::Structured(s)) if s == "https://example.com/json"
        );
        assert_eq!(decode_value::<String>("plain").unwrap(), "plain");
    }

    #[test]
    fn test_structured_reader_rejects_garbage() {
        assert_matches!(decode::<Profile>("not json"), Err(Error::Decode(_)));
        assert!(decode_value::<u64>("abc").is_err());
    }

    #[test]
    fn test_encoded_empty_string_is_not_a_tombstone() {
        let encoded = encode(&String::new()).unwrap();
        assert_ne!(encoded, TOMBSTONE);
        assert_eq!(decode_value::<String>(&encoded).unwrap(), "");
    }

    #[test]
    fn test_envelope_freshness() {
        let fresh = LogicalEnvelope::new("1".into(), Duration::from_secs(60)).unwrap();
        assert!(fresh.is_fresh());

        let stale = LogicalEnvelope::new("1".into(), Duration::ZERO).unwrap();
        assert!(!stale.is_fresh());

        let parsed = LogicalEnvelope::from_json(&fresh.to_json().unwrap()).unwrap();
        assert_eq!(parsed, fresh);
        assert!(LogicalEnvelope::from_json("{}").is_err());
    }

    #[test]
    fn test_renewed_expiry_strictly_increases() {
        let previous = LogicalEnvelope::new("1".into(), Duration::from_secs(3600)).unwrap();
        let renewed =
            LogicalEnvelope::renewed("2".into(), Duration::ZERO, Some(&previous)).unwrap();

        assert!(renewed.logical_expire_at > previous.logical_expire_at);
        assert_eq!(renewed.payload, "2");
    }
}
