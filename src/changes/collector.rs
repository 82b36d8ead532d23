//! Change collector: buffers item-level events per collection.

use crate::types::{ChangeEvent, CollectionChanges, CollectionKind, CollectionName};
use std::collections::{HashMap, HashSet};

/// Receives low-level change events as the store applies a transaction.
pub trait ChangeSink {
    fn record(&mut self, event: ChangeEvent);
}

/// Accumulates events keyed by collection identity until the owning
/// transaction commits.
///
/// Collections are tracked in first-touched order; that order is the
/// observable contract of the delivered changeset. The kind resolved for a
/// collection on first touch is cached for the session. Events for
/// unsupported kinds are dropped with a warning, once per collection,
/// and replay continues.
pub struct ChangeCollector {
    /// First-touched order within the current transaction.
    order: Vec<CollectionName>,
    buffers: HashMap<CollectionName, CollectionChanges>,
    /// Kind classification cache, kept for the life of the session.
    kinds: HashMap<CollectionName, CollectionKind>,
    /// Collections already warned about, so the diagnostic fires once.
    warned: HashSet<CollectionName>,
}

impl ChangeCollector {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            buffers: HashMap::new(),
            kinds: HashMap::new(),
            warned: HashSet::new(),
        }
    }

    /// Whether the current transaction has produced any tracked changes.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Drain the buffered changes in first-touched order, resetting the
    /// per-transaction buffers. Kind classifications survive the drain.
    pub fn drain(&mut self) -> Vec<CollectionChanges> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|name| self.buffers.remove(&name))
            .collect()
    }

    /// Discard any buffered changes without delivering them.
    pub fn clear(&mut self) {
        self.order.clear();
        self.buffers.clear();
    }
}

impl Default for ChangeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSink for ChangeCollector {
    fn record(&mut self, event: ChangeEvent) {
        let kind = *self
            .kinds
            .entry(event.collection.clone())
            .or_insert(event.kind);

        if !kind.is_supported() {
            if self.warned.insert(event.collection.clone()) {
                tracing::warn!(
                    collection = %event.collection,
                    "dropping change events for unsupported collection kind"
                );
            }
            return;
        }

        let buffer = self
            .buffers
            .entry(event.collection.clone())
            .or_insert_with(|| {
                self.order.push(event.collection.clone());
                CollectionChanges {
                    collection: event.collection.clone(),
                    kind,
                    changes: Vec::new(),
                }
            });
        buffer.changes.push(event.change);
    }
}
