//! Live state access and the shared commit pipeline.
//!
//! Every committed transaction, replayed or live, flows through one
//! [`CommitPipeline`]: apply to the store, flush the aggregator, deliver
//! the changeset to observers. A commit gate serializes the three steps so
//! notification order always matches commit order.

use crate::changes::TransactionAggregator;
use crate::engine::{EngineStatus, StatusCell};
use crate::error::{EngineError, Result};
use crate::store::CollectionStore;
use crate::subscriptions::SubscriptionManager;
use crate::types::{
    CollectionInfo, CollectionKind, CollectionName, CollectionOperation, CollectionSchema,
    Timestamp, TransactionChangeSet, TransactionRecord,
};
use crate::values::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Apply → flush → notify, serialized by the commit gate.
pub struct CommitPipeline {
    store: Arc<CollectionStore>,
    aggregator: Mutex<TransactionAggregator>,
    subscriptions: Arc<SubscriptionManager>,
    gate: Mutex<()>,
}

impl CommitPipeline {
    pub(crate) fn new(store: Arc<CollectionStore>, subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            store,
            aggregator: Mutex::new(TransactionAggregator::new()),
            subscriptions,
            gate: Mutex::new(()),
        }
    }

    /// Commit one transaction and deliver its changeset.
    ///
    /// On failure the aggregator is reset before anything reaches an
    /// observer, so no partial notification is ever delivered. Live commits
    /// are additionally appended to the store's delta log for incremental
    /// backups.
    pub(crate) fn commit(
        &self,
        record: &TransactionRecord,
        live: bool,
    ) -> Result<TransactionChangeSet> {
        let _gate = self.gate.lock();

        let mut aggregator = self.aggregator.lock();
        aggregator.begin(record.id, record.timestamp);
        if let Err(e) = self.store.apply_transaction(record, aggregator.sink()) {
            aggregator.abort();
            return Err(e);
        }
        let set = aggregator.flush();
        drop(aggregator);

        if live {
            self.store.record_delta(record.clone());
        }
        self.subscriptions.deliver(&set);
        Ok(set)
    }

    /// Run `f` while holding the commit gate, so no commit can be applied
    /// or mid-flight while it executes. Backup capture uses this to read
    /// state and the delta log as one consistent point in time.
    pub(crate) fn quiesce<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = self.gate.lock();
        f()
    }
}

/// Read (and, once parsing has completed, write) access to the restored
/// collection state.
///
/// Reads are valid from the moment parsing starts and always see a
/// consistent point-in-time view: the already-replayed prefix of the
/// chain. Writes are rejected with
/// [`WriteBeforeParseComplete`](EngineError::WriteBeforeParseComplete)
/// until parsing completes.
#[derive(Clone)]
pub struct StateHandle {
    store: Arc<CollectionStore>,
    pipeline: Arc<CommitPipeline>,
    status: Arc<StatusCell>,
}

impl StateHandle {
    pub(crate) fn new(
        store: Arc<CollectionStore>,
        pipeline: Arc<CommitPipeline>,
        status: Arc<StatusCell>,
    ) -> Self {
        Self {
            store,
            pipeline,
            status,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.status.load() == EngineStatus::Closed {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    // --- Reads ---

    pub fn collections(&self) -> Result<Vec<CollectionInfo>> {
        self.check_open()?;
        Ok(self.store.collections())
    }

    pub fn kind_of(&self, name: &CollectionName) -> Result<Option<CollectionKind>> {
        self.check_open()?;
        Ok(self.store.kind_of(name))
    }

    pub fn schema(&self, name: &CollectionName) -> Result<Option<CollectionSchema>> {
        self.check_open()?;
        Ok(self.store.schema(name))
    }

    pub fn get(&self, name: &CollectionName, key: &Value) -> Result<Option<Value>> {
        self.check_open()?;
        self.store.get(name, key)
    }

    pub fn contains_key(&self, name: &CollectionName, key: &Value) -> Result<bool> {
        self.check_open()?;
        self.store.contains_key(name, key)
    }

    pub fn len(&self, name: &CollectionName) -> Result<usize> {
        self.check_open()?;
        self.store.len(name)
    }

    pub fn entries(&self, name: &CollectionName) -> Result<Vec<(Value, Value)>> {
        self.check_open()?;
        self.store.entries(name)
    }

    pub fn peek(&self, name: &CollectionName) -> Result<Option<Value>> {
        self.check_open()?;
        self.store.peek(name)
    }

    pub fn queue_items(&self, name: &CollectionName) -> Result<Vec<Value>> {
        self.check_open()?;
        self.store.queue_items(name)
    }

    // --- Writes ---

    /// Start a live write transaction.
    ///
    /// Only valid once parsing has completed; operations are buffered and
    /// applied atomically on [`WriteTransaction::commit`].
    pub fn begin_transaction(&self) -> Result<WriteTransaction<'_>> {
        match self.status.load() {
            EngineStatus::Closed => Err(EngineError::Closed),
            EngineStatus::Completed => Ok(WriteTransaction {
                handle: self,
                operations: Vec::new(),
                pending: HashMap::new(),
            }),
            _ => Err(EngineError::WriteBeforeParseComplete),
        }
    }
}

/// A buffered live transaction. Nothing is visible, logged, or notified
/// until `commit`; dropping the transaction discards it.
pub struct WriteTransaction<'a> {
    handle: &'a StateHandle,
    operations: Vec<CollectionOperation>,
    /// Schemas declared by this transaction, visible to its later
    /// operations before commit.
    pending: HashMap<CollectionName, CollectionSchema>,
}

impl<'a> WriteTransaction<'a> {
    // --- Collection Creation ---

    pub fn create_dictionary(
        &mut self,
        name: impl Into<CollectionName>,
        key_type: impl Into<String>,
        value_type: impl Into<String>,
    ) -> Result<()> {
        self.create(name.into(), CollectionKind::Dictionary, Some(key_type.into()), value_type.into())
    }

    pub fn create_queue(
        &mut self,
        name: impl Into<CollectionName>,
        value_type: impl Into<String>,
    ) -> Result<()> {
        self.create(name.into(), CollectionKind::Queue, None, value_type.into())
    }

    pub fn create_concurrent_queue(
        &mut self,
        name: impl Into<CollectionName>,
        value_type: impl Into<String>,
    ) -> Result<()> {
        self.create(
            name.into(),
            CollectionKind::ConcurrentQueue,
            None,
            value_type.into(),
        )
    }

    fn create(
        &mut self,
        name: CollectionName,
        kind: CollectionKind,
        key_type: Option<String>,
        value_type: String,
    ) -> Result<()> {
        if self.pending.contains_key(&name) || self.handle.store.schema(&name).is_some() {
            return Err(EngineError::CollectionExists(name));
        }
        self.pending.insert(
            name.clone(),
            CollectionSchema {
                name: name.clone(),
                kind,
                kind_tag: kind.tag().to_string(),
                key_type: key_type.clone(),
                value_type: value_type.clone(),
            },
        );
        self.operations.push(CollectionOperation::CreateCollection {
            name,
            kind: kind.tag().to_string(),
            key_type,
            value_type,
        });
        Ok(())
    }

    // --- Dictionary Operations ---

    pub fn insert(&mut self, name: impl Into<CollectionName>, key: Value, value: Value) -> Result<()> {
        let name = name.into();
        let schema = self.schema_for(&name)?;
        let key = self.encode_key(&schema, &key)?;
        let value = self.encode_value(&schema, &value)?;
        self.operations.push(CollectionOperation::Insert { name, key, value });
        Ok(())
    }

    pub fn update(&mut self, name: impl Into<CollectionName>, key: Value, value: Value) -> Result<()> {
        let name = name.into();
        let schema = self.schema_for(&name)?;
        let key = self.encode_key(&schema, &key)?;
        let value = self.encode_value(&schema, &value)?;
        self.operations.push(CollectionOperation::Update { name, key, value });
        Ok(())
    }

    pub fn remove(&mut self, name: impl Into<CollectionName>, key: Value) -> Result<()> {
        let name = name.into();
        let schema = self.schema_for(&name)?;
        let key = self.encode_key(&schema, &key)?;
        self.operations.push(CollectionOperation::Remove { name, key });
        Ok(())
    }

    pub fn clear(&mut self, name: impl Into<CollectionName>) -> Result<()> {
        let name = name.into();
        self.schema_for(&name)?;
        self.operations.push(CollectionOperation::Clear { name });
        Ok(())
    }

    // --- Queue Operations ---

    pub fn enqueue(&mut self, name: impl Into<CollectionName>, value: Value) -> Result<()> {
        let name = name.into();
        let schema = self.schema_for(&name)?;
        let value = self.encode_value(&schema, &value)?;
        self.operations.push(CollectionOperation::Enqueue { name, value });
        Ok(())
    }

    pub fn dequeue(&mut self, name: impl Into<CollectionName>) -> Result<()> {
        let name = name.into();
        self.schema_for(&name)?;
        self.operations.push(CollectionOperation::Dequeue { name });
        Ok(())
    }

    /// Number of buffered operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Commit the buffered operations atomically.
    ///
    /// The transaction flows through the same pipeline as replay, so
    /// observers see it exactly like a replayed one.
    pub fn commit(self) -> Result<TransactionChangeSet> {
        if self.operations.is_empty() {
            return Err(EngineError::EmptyTransaction);
        }
        // Re-check: the engine may have been closed since the transaction
        // was opened.
        if self.handle.status.load() == EngineStatus::Closed {
            return Err(EngineError::Closed);
        }

        let record = TransactionRecord {
            id: self.handle.store.allocate_live_id(),
            timestamp: Timestamp::now(),
            operations: self.operations,
        };
        self.handle.pipeline.commit(&record, true)
    }

    fn schema_for(&self, name: &CollectionName) -> Result<CollectionSchema> {
        let schema = match self.pending.get(name) {
            Some(schema) => schema.clone(),
            None => self
                .handle
                .store
                .schema(name)
                .ok_or_else(|| EngineError::CollectionNotFound(name.clone()))?,
        };
        if schema.kind == CollectionKind::Unknown {
            return Err(EngineError::UnsupportedCollectionKind {
                collection: name.clone(),
                kind: schema.kind_tag,
            });
        }
        Ok(schema)
    }

    fn encode_key(&self, schema: &CollectionSchema, key: &Value) -> Result<Vec<u8>> {
        let key_type = schema.key_type.as_deref().ok_or(EngineError::KindMismatch {
            collection: schema.name.clone(),
            expected: CollectionKind::Dictionary,
            actual: schema.kind,
        })?;
        self.encode(schema, key_type, key)
    }

    fn encode_value(&self, schema: &CollectionSchema, value: &Value) -> Result<Vec<u8>> {
        self.encode(schema, &schema.value_type, value)
    }

    fn encode(&self, schema: &CollectionSchema, type_name: &str, value: &Value) -> Result<Vec<u8>> {
        match self.handle.store.types().encode(type_name, value) {
            Ok(bytes) => Ok(bytes),
            Err(_) if value.type_name() != type_name => Err(EngineError::TypeMismatch {
                collection: schema.name.clone(),
                expected: type_name.to_string(),
                got: value.type_name().to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}
