//! Per-transaction change tracking.
//!
//! The store emits one [`ChangeEvent`](crate::types::ChangeEvent) per item
//! mutation into a [`ChangeSink`]. The [`ChangeCollector`] buffers those
//! events per collection until the owning transaction commits; the
//! [`TransactionAggregator`] scopes the collector to one transaction at a
//! time and seals the buffered changes into a
//! [`TransactionChangeSet`](crate::types::TransactionChangeSet) on flush.

mod aggregator;
mod collector;

pub use aggregator::TransactionAggregator;
pub use collector::{ChangeCollector, ChangeSink};
