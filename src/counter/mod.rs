//! Access Counting and Rankings
//!
//! [`CounterAggregator`] absorbs high-frequency access events in the volatile
//! store and flushes them to the record store in batches. [`RankingReader`]
//! answers top-N queries from the sorted sets the aggregator maintains.

pub mod aggregator;
pub mod ranking;

pub use aggregator::{AccessOutcome, CounterAggregator, FlushOutcome, PendingFlush};
pub use ranking::{RankedItem, RankingReader};
