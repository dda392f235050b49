//! Infrastructure Adapters
//!
//! Adapter implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Ports (domain::ports)                         │
//! │           VolatileStore          │        RecordStore            │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  InMemoryVolatileStore │ RedisVolatileStore │ InMemoryRecordStore│
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use linkcache::adapters::{InMemoryRecordStore, InMemoryVolatileStore};
//!
//! let store: Arc<dyn VolatileStore> = Arc::new(InMemoryVolatileStore::new());
//! let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
//! ```

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{InMemoryRecordStore, InMemoryVolatileStore};
#[cfg(feature = "redis")]
pub use self::redis::RedisVolatileStore;
