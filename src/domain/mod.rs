//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the volatile and durable stores
//! - **Events** (`events.rs`) - Cache events for audit logging
//!
//! # Usage
//!
//! ```ignore
//! use linkcache::domain::ports::{RecordStore, VolatileStore};
//!
//! async fn warm<V, R>(store: &V, records: &R, id: &str) -> Result<()>
//! where
//!     V: VolatileStore,
//!     R: RecordStore,
//! {
//!     if let Some(record) = records.find_by_key(id).await? {
//!         store.set(id, &record.payload, None).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::CacheEvent;
pub use ports::{OwnerId, RankingScope, RecordStore, TrackedRecord, VolatileStore};
