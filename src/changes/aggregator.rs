//! Transaction change aggregator.

use super::collector::ChangeCollector;
use crate::types::{Timestamp, TransactionChangeSet, TransactionId};

/// Scopes the [`ChangeCollector`] to one transaction at a time.
///
/// `begin` opens a transaction scope (idempotent while one is open);
/// `flush` seals everything collected since the last flush into one
/// [`TransactionChangeSet`] and resets for the next transaction. Flushing
/// again without an intervening `begin` returns an empty set: a second
/// flush for one commit is a caller bug, not engine state corruption, and
/// must not re-deliver.
pub struct TransactionAggregator {
    collector: ChangeCollector,
    open: Option<(TransactionId, Timestamp)>,
    /// Identity of the most recently flushed transaction, stamped onto
    /// empty drains.
    last: (TransactionId, Timestamp),
}

impl TransactionAggregator {
    pub fn new() -> Self {
        Self {
            collector: ChangeCollector::new(),
            open: None,
            last: (TransactionId(0), Timestamp(0)),
        }
    }

    /// Open the scope for one transaction. No-op if a scope is already open.
    pub fn begin(&mut self, id: TransactionId, timestamp: Timestamp) {
        if self.open.is_none() {
            self.open = Some((id, timestamp));
        }
    }

    /// The sink the store writes events into while applying the open
    /// transaction.
    pub fn sink(&mut self) -> &mut ChangeCollector {
        &mut self.collector
    }

    /// Seal and return the open transaction's changeset, resetting for the
    /// next transaction. Without an open scope this drains nothing and
    /// returns an empty set.
    pub fn flush(&mut self) -> TransactionChangeSet {
        match self.open.take() {
            Some((id, timestamp)) => {
                self.last = (id, timestamp);
                TransactionChangeSet {
                    transaction_id: id,
                    timestamp,
                    collections: self.collector.drain(),
                }
            }
            None => TransactionChangeSet {
                transaction_id: self.last.0,
                timestamp: self.last.1,
                collections: Vec::new(),
            },
        }
    }

    /// Abandon the open transaction, discarding anything collected for it.
    pub fn abort(&mut self) {
        self.open = None;
        self.collector.clear();
    }
}

impl Default for TransactionAggregator {
    fn default() -> Self {
        Self::new()
    }
}
