//! Property-Based Tests for Keys and Payload Codec
//!
//! # Test Properties
//!
//! 1. **Key Identity**: a (prefix, id) pair always maps to one key and splits back
//! 2. **Payload Roundtrip**: decode(encode(v)) = v for every supported payload type
//! 3. **Raw Fallback**: plain text read as a string comes back unchanged
//! 4. **Monotonic Expiry**: a renewed envelope always expires after the one it replaces

#![cfg(test)]

use std::time::Duration;

use proptest::prelude::*;

use super::codec::{decode, decode_value, encode, DecodedValue, LogicalEnvelope, TOMBSTONE};
use super::keys::{CacheKey, LINK_CACHE_PREFIX, LINK_HOT_PREFIX};
use crate::domain::ports::TrackedRecord;

// =============================================================================
// Property Strategies
// =============================================================================

fn prefix_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just(LINK_CACHE_PREFIX), Just(LINK_HOT_PREFIX), Just("user:")]
}

/// Short-code style identifiers
fn id_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9]{1,12}"
}

/// Text that is never a JSON document
fn plain_text_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9:/._-]{0,60}".prop_filter("JSON literals", |s| {
        !matches!(s.as_str(), "true" | "false" | "null")
    })
}

fn record_strategy() -> impl Strategy<Value = TrackedRecord> {
    (id_strategy(), "https://[a-z]{1,20}\\.com/[a-z0-9]{0,20}", any::<u64>(), prop::option::of("[0-9]{1,6}"))
        .prop_map(|(id, url, total, owner)| {
            let record = TrackedRecord::new(id, url).with_total(total);
            match owner {
                Some(owner) => record.with_owner(owner),
                None => record,
            }
        })
}

// =============================================================================
// Key Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_key_splits_back_into_parts(prefix in prefix_strategy(), id in id_strategy()) {
        let key = CacheKey::new(prefix, &id);

        prop_assert_eq!(key.prefix(), prefix);
        prop_assert_eq!(key.id(), id.as_str());
        prop_assert_eq!(key.clone(), CacheKey::new(prefix, &id));
        prop_assert!(key.lock_key().ends_with(key.as_str()));
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_string_roundtrip(value in ".*") {
        let encoded = encode(&value).unwrap();
        prop_assert_ne!(encoded.as_str(), TOMBSTONE);
        prop_assert_eq!(decode_value::<String>(&encoded).unwrap(), value);
    }

    #[test]
    fn prop_record_roundtrip(record in record_strategy()) {
        let encoded = encode(&record).unwrap();
        prop_assert_eq!(decode_value::<TrackedRecord>(&encoded).unwrap(), record);
    }

    #[test]
    fn prop_plain_text_is_returned_raw(text in plain_text_strategy()) {
        match decode::<String>(&text).unwrap() {
            DecodedValue::Raw(raw) => prop_assert_eq!(raw, text),
            DecodedValue::Structured(value) => {
                prop_assert!(false, "unexpected structured decode: {}", value)
            }
        }
    }

    #[test]
    fn prop_renewed_expiry_strictly_increases(
        previous_secs in 0u64..7200,
        ttl_secs in 0u64..7200,
    ) {
        let previous = LogicalEnvelope::new("1".into(), Duration::from_secs(previous_secs)).unwrap();
        let renewed = LogicalEnvelope::renewed(
            "2".into(),
            Duration::from_secs(ttl_secs),
            Some(&previous),
        )
        .unwrap();

        prop_assert!(renewed.logical_expire_at > previous.logical_expire_at);
    }
}
