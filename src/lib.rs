//! linkcache - Cache and Counter Tier for a Short-Link Service
//!
//! Sits between a request path and a durable record store and handles three
//! load problems at once:
//!
//! - cache penetration: lookups of keys that do not exist are answered by a
//!   cached tombstone instead of the record store
//! - cache breakdown: hot keys expire logically and are rebuilt in the
//!   background by a single lock holder while readers get the stale value
//! - write amplification: access counts accumulate in the volatile store,
//!   flush to the record store in batches and feed live rankings
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          LinkService                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │ NegativeCache│  │ LogicalCache │  │ CounterAggregator    │   │
//! │  │ Guard        │  │ (SWR)        │  │ RankingReader        │   │
//! │  └──────────────┘  └──────┬───────┘  └──────────┬───────────┘   │
//! │                    rebuild TaskPool    access TaskPool          │
//! └─────────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//!     VolatileStore (Redis)               RecordStore (SQL)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory and Redis implementations of the ports
//! - [`cache`] - Guard, stale-while-revalidate cache, locks, codec, executor
//! - [`config`] - TTLs, thresholds and pool sizes
//! - [`counter`] - Access aggregation and rankings
//! - [`domain`] - Ports and events
//! - [`error`] - Error types
//! - [`service`] - Short-link facade

pub mod adapters;
pub mod cache;
pub mod config;
pub mod counter;
pub mod domain;
pub mod error;
pub mod service;

// Re-export commonly used types
pub use cache::{CacheMetrics, LogicalCache, NegativeCacheGuard, TaskPool};
pub use config::CacheSettings;
pub use counter::{CounterAggregator, RankedItem, RankingReader};
pub use domain::{OwnerId, RankingScope, RecordStore, TrackedRecord, VolatileStore};
pub use error::{Error, Result};
pub use service::LinkService;
