//! Cache Tier
//!
//! Two read paths over the shared volatile store:
//!
//! - [`NegativeCacheGuard`]: read-through with cached absence, for keys that
//!   may not exist
//! - [`LogicalCache`]: stale-while-revalidate with background rebuilds, for
//!   hot keys that must never stampede the record store
//!
//! Both build keys through [`keys`], encode payloads through [`codec`] and
//! report into a shared [`CacheMetrics`].

pub mod codec;
pub mod executor;
pub mod guard;
pub mod keys;
pub mod lock;
pub mod logical;
pub mod metrics;

#[cfg(test)]
mod proptest;

pub use codec::{CachePayload, DecodedValue, LogicalEnvelope, PayloadShape, TOMBSTONE};
pub use executor::{SubmitError, TaskPool};
pub use guard::NegativeCacheGuard;
pub use keys::CacheKey;
pub use lock::{LockLease, LockManager};
pub use logical::LogicalCache;
pub use metrics::{CacheMetrics, MetricsSnapshot};
