//! Collection state store.
//!
//! Holds the live, restored collection state: named dictionaries (ordered
//! key/value maps) and queues, created and mutated only through logged
//! transactions. A transaction is applied in two phases under one write
//! lock: every operation is first validated and staged against a scratch
//! overlay of the touched collections, then the overlay is merged into the
//! live state. Readers never observe a torn transaction and a rejected
//! transaction leaves no trace.
//!
//! While applying, the store emits one decoded [`ChangeEvent`] per item
//! mutation into the caller-provided [`ChangeSink`]; the change-tracking
//! layer turns those into per-transaction changesets.

mod handle;

pub use handle::{CommitPipeline, StateHandle, WriteTransaction};

use crate::changes::ChangeSink;
use crate::error::{EngineError, Result};
use crate::types::{
    ChangeEvent, CollectionInfo, CollectionKind, CollectionName, CollectionOperation,
    CollectionSchema, ItemChange, TransactionId, TransactionRecord,
};
use crate::values::{TypeRegistry, Value};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Materialized state of one collection. Keys and values stay in their
/// encoded form; decoding happens at the read/event boundary.
#[derive(Clone, Debug)]
enum CollectionState {
    Dictionary(BTreeMap<Vec<u8>, Vec<u8>>),
    Queue(VecDeque<Vec<u8>>),
    /// Unknown-kind collections keep their schema but no state; their
    /// operations pass through as events only.
    Unmaterialized,
}

struct StoreInner {
    schemas: HashMap<CollectionName, CollectionSchema>,
    /// Collection creation order, the order backups are synthesized in.
    order: Vec<CollectionName>,
    state: HashMap<CollectionName, CollectionState>,
    /// Live transactions committed since the last kept backup.
    delta: Vec<TransactionRecord>,
    /// Next id handed to a live write transaction.
    next_live_id: u64,
}

/// In-memory store of reliable collections, reconstructed by replay.
pub struct CollectionStore {
    types: TypeRegistry,
    inner: RwLock<StoreInner>,
}

impl CollectionStore {
    pub fn new(types: TypeRegistry) -> Self {
        Self {
            types,
            inner: RwLock::new(StoreInner {
                schemas: HashMap::new(),
                order: Vec::new(),
                state: HashMap::new(),
                delta: Vec::new(),
                next_live_id: 1,
            }),
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    // --- Transaction Application ---

    /// Validate and apply one committed transaction, emitting a decoded
    /// change event per item mutation into `sink`.
    ///
    /// All operations are staged against a scratch overlay first; the live
    /// state is only touched once the whole transaction has validated, so
    /// failure can never leave a partial application behind.
    pub fn apply_transaction(
        &self,
        record: &TransactionRecord,
        sink: &mut dyn ChangeSink,
    ) -> Result<()> {
        if record.operations.is_empty() {
            return Err(EngineError::EmptyTransaction);
        }

        let mut inner = self.inner.write();
        let mut scratch: HashMap<CollectionName, CollectionState> = HashMap::new();
        let mut created: Vec<CollectionSchema> = Vec::new();
        let mut events: Vec<ChangeEvent> = Vec::new();

        for operation in &record.operations {
            self.stage_operation(&inner, &mut scratch, &mut created, &mut events, operation)?;
        }

        // Whole transaction validated; merge the overlay.
        for schema in created {
            inner.order.push(schema.name.clone());
            inner.schemas.insert(schema.name.clone(), schema);
        }
        for (name, state) in scratch {
            inner.state.insert(name, state);
        }
        inner.next_live_id = inner.next_live_id.max(record.id.0 + 1);
        drop(inner);

        for event in events {
            sink.record(event);
        }
        Ok(())
    }

    fn stage_operation(
        &self,
        inner: &StoreInner,
        scratch: &mut HashMap<CollectionName, CollectionState>,
        created: &mut Vec<CollectionSchema>,
        events: &mut Vec<ChangeEvent>,
        operation: &CollectionOperation,
    ) -> Result<()> {
        match operation {
            CollectionOperation::CreateCollection {
                name,
                kind,
                key_type,
                value_type,
            } => {
                if inner.schemas.contains_key(name) || created.iter().any(|s| &s.name == name) {
                    return Err(EngineError::CollectionExists(name.clone()));
                }
                let resolved = CollectionKind::from_tag(kind);
                scratch.insert(
                    name.clone(),
                    match resolved {
                        CollectionKind::Dictionary => CollectionState::Dictionary(BTreeMap::new()),
                        CollectionKind::Queue | CollectionKind::ConcurrentQueue => {
                            CollectionState::Queue(VecDeque::new())
                        }
                        CollectionKind::Unknown => CollectionState::Unmaterialized,
                    },
                );
                created.push(CollectionSchema {
                    name: name.clone(),
                    kind: resolved,
                    kind_tag: kind.clone(),
                    key_type: key_type.clone(),
                    value_type: value_type.clone(),
                });
                Ok(())
            }

            CollectionOperation::Insert { name, key, value } => {
                let schema = lookup_schema(inner, created, name)?;
                if schema.kind == CollectionKind::Unknown {
                    events.push(self.event(&schema, ItemChange::Added {
                        key: Some(self.decode_key(&schema, key)),
                        value: self.decode_value(&schema, value),
                    }));
                    return Ok(());
                }
                let entries = dictionary_mut(scratch, inner, &schema)?;
                if entries.contains_key(key) {
                    return Err(EngineError::DuplicateKey {
                        collection: name.clone(),
                        key: self.key_display(&schema, key),
                    });
                }
                entries.insert(key.clone(), value.clone());
                events.push(self.event(&schema, ItemChange::Added {
                    key: Some(self.decode_key(&schema, key)),
                    value: self.decode_value(&schema, value),
                }));
                Ok(())
            }

            CollectionOperation::Update { name, key, value } => {
                let schema = lookup_schema(inner, created, name)?;
                if schema.kind == CollectionKind::Unknown {
                    events.push(self.event(&schema, ItemChange::Updated {
                        key: self.decode_key(&schema, key),
                        value: self.decode_value(&schema, value),
                    }));
                    return Ok(());
                }
                let entries = dictionary_mut(scratch, inner, &schema)?;
                if !entries.contains_key(key) {
                    return Err(EngineError::KeyNotFound {
                        collection: name.clone(),
                        key: self.key_display(&schema, key),
                    });
                }
                entries.insert(key.clone(), value.clone());
                events.push(self.event(&schema, ItemChange::Updated {
                    key: self.decode_key(&schema, key),
                    value: self.decode_value(&schema, value),
                }));
                Ok(())
            }

            CollectionOperation::Remove { name, key } => {
                let schema = lookup_schema(inner, created, name)?;
                if schema.kind == CollectionKind::Unknown {
                    events.push(self.event(&schema, ItemChange::Removed {
                        key: Some(self.decode_key(&schema, key)),
                        value: None,
                    }));
                    return Ok(());
                }
                let entries = dictionary_mut(scratch, inner, &schema)?;
                match entries.remove(key) {
                    Some(old) => {
                        events.push(self.event(&schema, ItemChange::Removed {
                            key: Some(self.decode_key(&schema, key)),
                            value: Some(self.decode_value(&schema, &old)),
                        }));
                        Ok(())
                    }
                    None => Err(EngineError::KeyNotFound {
                        collection: name.clone(),
                        key: self.key_display(&schema, key),
                    }),
                }
            }

            CollectionOperation::Clear { name } => {
                let schema = lookup_schema(inner, created, name)?;
                match schema.kind {
                    CollectionKind::Unknown => {}
                    _ => match touch(scratch, inner, name)? {
                        CollectionState::Dictionary(entries) => entries.clear(),
                        CollectionState::Queue(items) => items.clear(),
                        CollectionState::Unmaterialized => {}
                    },
                }
                events.push(self.event(&schema, ItemChange::Cleared));
                Ok(())
            }

            CollectionOperation::Enqueue { name, value } => {
                let schema = lookup_schema(inner, created, name)?;
                if schema.kind == CollectionKind::Unknown {
                    events.push(self.event(&schema, ItemChange::Added {
                        key: None,
                        value: self.decode_value(&schema, value),
                    }));
                    return Ok(());
                }
                let items = queue_mut(scratch, inner, &schema)?;
                items.push_back(value.clone());
                events.push(self.event(&schema, ItemChange::Added {
                    key: None,
                    value: self.decode_value(&schema, value),
                }));
                Ok(())
            }

            CollectionOperation::Dequeue { name } => {
                let schema = lookup_schema(inner, created, name)?;
                if schema.kind == CollectionKind::Unknown {
                    events.push(self.event(&schema, ItemChange::Removed {
                        key: None,
                        value: None,
                    }));
                    return Ok(());
                }
                let items = queue_mut(scratch, inner, &schema)?;
                match items.pop_front() {
                    Some(front) => {
                        events.push(self.event(&schema, ItemChange::Removed {
                            key: None,
                            value: Some(self.decode_value(&schema, &front)),
                        }));
                        Ok(())
                    }
                    None => Err(EngineError::EmptyQueue(name.clone())),
                }
            }
        }
    }

    fn event(&self, schema: &CollectionSchema, change: ItemChange) -> ChangeEvent {
        ChangeEvent {
            collection: schema.name.clone(),
            kind: schema.kind,
            change,
        }
    }

    fn decode_key(&self, schema: &CollectionSchema, bytes: &[u8]) -> Value {
        let type_name = schema.key_type.as_deref().unwrap_or("bytes");
        self.types.decode(type_name, bytes)
    }

    fn decode_value(&self, schema: &CollectionSchema, bytes: &[u8]) -> Value {
        self.types.decode(&schema.value_type, bytes)
    }

    fn key_display(&self, schema: &CollectionSchema, bytes: &[u8]) -> String {
        format!("{:?}", self.decode_key(schema, bytes))
    }

    // --- Reads ---

    pub fn kind_of(&self, name: &CollectionName) -> Option<CollectionKind> {
        self.inner.read().schemas.get(name).map(|s| s.kind)
    }

    pub fn schema(&self, name: &CollectionName) -> Option<CollectionSchema> {
        self.inner.read().schemas.get(name).cloned()
    }

    /// Live collections in creation order.
    pub fn collections(&self) -> Vec<CollectionInfo> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| {
                let schema = inner.schemas.get(name)?;
                let len = match inner.state.get(name) {
                    Some(CollectionState::Dictionary(entries)) => entries.len(),
                    Some(CollectionState::Queue(items)) => items.len(),
                    _ => 0,
                };
                Some(CollectionInfo {
                    name: name.clone(),
                    kind: schema.kind,
                    len,
                })
            })
            .collect()
    }

    /// Look up a dictionary value by decoded key.
    pub fn get(&self, name: &CollectionName, key: &Value) -> Result<Option<Value>> {
        let inner = self.inner.read();
        let schema = supported_schema(&inner, name)?;
        let key_type = schema.key_type.as_deref().unwrap_or("bytes");
        let encoded = self.types.encode(key_type, key)?;
        match inner.state.get(name) {
            Some(CollectionState::Dictionary(entries)) => Ok(entries
                .get(&encoded)
                .map(|bytes| self.decode_value(&schema, bytes))),
            _ => Err(kind_mismatch(name, CollectionKind::Dictionary, schema.kind)),
        }
    }

    pub fn contains_key(&self, name: &CollectionName, key: &Value) -> Result<bool> {
        Ok(self.get(name, key)?.is_some())
    }

    /// Item count of a dictionary or queue.
    pub fn len(&self, name: &CollectionName) -> Result<usize> {
        let inner = self.inner.read();
        supported_schema(&inner, name)?;
        match inner.state.get(name) {
            Some(CollectionState::Dictionary(entries)) => Ok(entries.len()),
            Some(CollectionState::Queue(items)) => Ok(items.len()),
            _ => Ok(0),
        }
    }

    /// All dictionary entries in key order, decoded.
    pub fn entries(&self, name: &CollectionName) -> Result<Vec<(Value, Value)>> {
        let inner = self.inner.read();
        let schema = supported_schema(&inner, name)?;
        match inner.state.get(name) {
            Some(CollectionState::Dictionary(entries)) => Ok(entries
                .iter()
                .map(|(k, v)| (self.decode_key(&schema, k), self.decode_value(&schema, v)))
                .collect()),
            _ => Err(kind_mismatch(name, CollectionKind::Dictionary, schema.kind)),
        }
    }

    /// The front of a queue without removing it.
    pub fn peek(&self, name: &CollectionName) -> Result<Option<Value>> {
        let inner = self.inner.read();
        let schema = supported_schema(&inner, name)?;
        match inner.state.get(name) {
            Some(CollectionState::Queue(items)) => Ok(items
                .front()
                .map(|bytes| self.decode_value(&schema, bytes))),
            _ => Err(kind_mismatch(name, CollectionKind::Queue, schema.kind)),
        }
    }

    /// All queue items front-to-back, decoded.
    pub fn queue_items(&self, name: &CollectionName) -> Result<Vec<Value>> {
        let inner = self.inner.read();
        let schema = supported_schema(&inner, name)?;
        match inner.state.get(name) {
            Some(CollectionState::Queue(items)) => Ok(items
                .iter()
                .map(|bytes| self.decode_value(&schema, bytes))
                .collect()),
            _ => Err(kind_mismatch(name, CollectionKind::Queue, schema.kind)),
        }
    }

    // --- Backup Support ---

    /// Synthesize the current state as base transactions for a full backup:
    /// one transaction per collection in creation order, dictionary entries
    /// in key order, queue items front-to-back. Ids number from 1.
    pub fn snapshot_records(&self) -> Vec<TransactionRecord> {
        let inner = self.inner.read();
        let mut records = Vec::with_capacity(inner.order.len());

        for (index, name) in inner.order.iter().enumerate() {
            let schema = match inner.schemas.get(name) {
                Some(s) => s,
                None => continue,
            };
            let mut operations = vec![CollectionOperation::CreateCollection {
                name: name.clone(),
                kind: schema.kind_tag.clone(),
                key_type: schema.key_type.clone(),
                value_type: schema.value_type.clone(),
            }];
            match inner.state.get(name) {
                Some(CollectionState::Dictionary(entries)) => {
                    for (key, value) in entries {
                        operations.push(CollectionOperation::Insert {
                            name: name.clone(),
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                }
                Some(CollectionState::Queue(items)) => {
                    for value in items {
                        operations.push(CollectionOperation::Enqueue {
                            name: name.clone(),
                            value: value.clone(),
                        });
                    }
                }
                _ => {}
            }
            records.push(TransactionRecord {
                id: TransactionId(index as u64 + 1),
                timestamp: crate::types::Timestamp::now(),
                operations,
            });
        }
        records
    }

    /// Live transactions committed since the last kept backup.
    pub fn delta_records(&self) -> Vec<TransactionRecord> {
        self.inner.read().delta.clone()
    }

    /// Number of live transactions in the delta log.
    pub fn delta_len(&self) -> usize {
        self.inner.read().delta.len()
    }

    /// Append one committed live transaction to the delta log.
    pub(crate) fn record_delta(&self, record: TransactionRecord) {
        self.inner.write().delta.push(record);
    }

    /// A backup covering the first `records` delta transactions was kept;
    /// only those leave the log. Transactions committed after the backup
    /// content was captured stay queued for the next incremental.
    pub fn confirm_baseline(&self, records: usize) {
        let mut inner = self.inner.write();
        let covered = records.min(inner.delta.len());
        inner.delta.drain(..covered);
    }

    /// Allocate the id for the next live write transaction.
    pub(crate) fn allocate_live_id(&self) -> TransactionId {
        let mut inner = self.inner.write();
        let id = TransactionId(inner.next_live_id);
        inner.next_live_id += 1;
        id
    }
}

fn lookup_schema(
    inner: &StoreInner,
    created: &[CollectionSchema],
    name: &CollectionName,
) -> Result<CollectionSchema> {
    inner
        .schemas
        .get(name)
        .or_else(|| created.iter().find(|s| &s.name == name))
        .cloned()
        .ok_or_else(|| EngineError::CollectionNotFound(name.clone()))
}

fn supported_schema(inner: &StoreInner, name: &CollectionName) -> Result<CollectionSchema> {
    let schema = inner
        .schemas
        .get(name)
        .ok_or_else(|| EngineError::CollectionNotFound(name.clone()))?;
    if schema.kind == CollectionKind::Unknown {
        return Err(EngineError::UnsupportedCollectionKind {
            collection: name.clone(),
            kind: schema.kind_tag.clone(),
        });
    }
    Ok(schema.clone())
}

/// Clone-on-first-touch overlay lookup for the staging pass.
fn touch<'a>(
    scratch: &'a mut HashMap<CollectionName, CollectionState>,
    inner: &StoreInner,
    name: &CollectionName,
) -> Result<&'a mut CollectionState> {
    if !scratch.contains_key(name) {
        let existing = inner
            .state
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::CollectionNotFound(name.clone()))?;
        scratch.insert(name.clone(), existing);
    }
    Ok(scratch.get_mut(name).expect("just inserted"))
}

fn dictionary_mut<'a>(
    scratch: &'a mut HashMap<CollectionName, CollectionState>,
    inner: &StoreInner,
    schema: &CollectionSchema,
) -> Result<&'a mut BTreeMap<Vec<u8>, Vec<u8>>> {
    match touch(scratch, inner, &schema.name)? {
        CollectionState::Dictionary(entries) => Ok(entries),
        _ => Err(kind_mismatch(
            &schema.name,
            CollectionKind::Dictionary,
            schema.kind,
        )),
    }
}

fn queue_mut<'a>(
    scratch: &'a mut HashMap<CollectionName, CollectionState>,
    inner: &StoreInner,
    schema: &CollectionSchema,
) -> Result<&'a mut VecDeque<Vec<u8>>> {
    match touch(scratch, inner, &schema.name)? {
        CollectionState::Queue(items) => Ok(items),
        _ => Err(kind_mismatch(&schema.name, CollectionKind::Queue, schema.kind)),
    }
}

fn kind_mismatch(
    name: &CollectionName,
    expected: CollectionKind,
    actual: CollectionKind,
) -> EngineError {
    EngineError::KindMismatch {
        collection: name.clone(),
        expected,
        actual,
    }
}
