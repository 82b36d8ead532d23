//! Transaction-applied notification registry.
//!
//! Observers are invoked synchronously on the replay (or live-commit)
//! thread, one call per committed transaction, in commit order. The engine
//! blocks on every observer before moving to the next transaction, so a
//! slow observer throttles replay; that backpressure is part of the
//! contract. Stream subscriptions forward into a bounded channel whose
//! send also blocks when full, preserving the same backpressure end to end.

use crate::types::TransactionChangeSet;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies one registered observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// An observer callback. Returning `false` reports the observer dead
/// (e.g., its channel disconnected) and it is removed after delivery.
type Observer = Arc<dyn Fn(&TransactionChangeSet) -> bool + Send + Sync>;

/// Registry of transaction-applied observers.
pub struct SubscriptionManager {
    observers: RwLock<HashMap<SubscriptionId, Observer>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer invoked once per committed transaction.
    pub fn subscribe(
        &self,
        observer: impl Fn(&TransactionChangeSet) -> bool + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.observers.write().insert(id, Arc::new(observer));
        id
    }

    /// Register a stream subscription with a bounded buffer.
    ///
    /// The forwarding send blocks while the buffer is full, so a stream the
    /// caller stops draining throttles replay rather than dropping
    /// notifications.
    pub fn subscribe_stream(&self, buffer: usize) -> TransactionStream {
        let (sender, receiver): (Sender<TransactionChangeSet>, Receiver<TransactionChangeSet>) =
            bounded(buffer);
        let id = self.subscribe(move |set| sender.send(set.clone()).is_ok());
        TransactionStream { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.write().remove(&id);
    }

    pub fn subscription_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver one changeset to every observer, synchronously. Observers
    /// that report failure are removed after delivery.
    ///
    /// The registry snapshot is taken before any observer runs, so an
    /// observer may subscribe or unsubscribe re-entrantly; a subscription
    /// added mid-delivery first sees the next changeset.
    pub fn deliver(&self, set: &TransactionChangeSet) {
        let snapshot: Vec<(SubscriptionId, Observer)> = {
            let observers = self.observers.read();
            observers
                .iter()
                .map(|(id, observer)| (*id, Arc::clone(observer)))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, observer) in snapshot {
            if !observer(set) {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut observers = self.observers.write();
            for id in dead {
                observers.remove(&id);
            }
        }
    }

    /// Drop every registered observer.
    pub fn clear(&self) {
        self.observers.write().clear();
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a stream subscription.
pub struct TransactionStream {
    id: SubscriptionId,
    receiver: Receiver<TransactionChangeSet>,
}

impl TransactionStream {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receive the next changeset (blocking).
    pub fn recv(&self) -> Result<TransactionChangeSet, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a changeset (non-blocking).
    pub fn try_recv(&self) -> Result<TransactionChangeSet, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<TransactionChangeSet, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
