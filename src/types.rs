//! Core types for the replay engine.

use crate::values::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable, URI-shaped identity of one reliable collection.
///
/// Immutable once the collection is created inside a chain.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionName(pub String);

impl CollectionName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Collection({})", self.0)
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CollectionName {
    fn from(s: &str) -> Self {
        CollectionName(s.to_string())
    }
}

impl From<String> for CollectionName {
    fn from(s: String) -> Self {
        CollectionName(s)
    }
}

/// Identifier of a logged transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn next(self) -> Self {
        TransactionId(self.0 + 1)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txn({})", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// SHA-256 digest of a segment log, recorded in the manifest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogDigest(pub [u8; 32]);

impl LogDigest {
    /// Compute digest from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        LogDigest(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(LogDigest(arr))
    }
}

impl fmt::Debug for LogDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for LogDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Kind of a reliable collection, discovered at replay time.
///
/// The wire carries a free-form tag so chains produced by newer writers
/// still deserialize; tags this version does not recognize map to `Unknown`
/// and their events are dropped with a diagnostic instead of failing replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    Dictionary,
    Queue,
    ConcurrentQueue,
    Unknown,
}

impl CollectionKind {
    /// Resolve a wire tag to a kind.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "dictionary" => CollectionKind::Dictionary,
            "queue" => CollectionKind::Queue,
            "concurrent_queue" => CollectionKind::ConcurrentQueue,
            _ => CollectionKind::Unknown,
        }
    }

    /// Canonical wire tag for a known kind.
    pub fn tag(&self) -> &'static str {
        match self {
            CollectionKind::Dictionary => "dictionary",
            CollectionKind::Queue => "queue",
            CollectionKind::ConcurrentQueue => "concurrent_queue",
            CollectionKind::Unknown => "unknown",
        }
    }

    /// Queue and ConcurrentQueue share FIFO semantics.
    pub fn is_queue_like(&self) -> bool {
        matches!(self, CollectionKind::Queue | CollectionKind::ConcurrentQueue)
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, CollectionKind::Unknown)
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Runtime-discovered schema of one collection.
///
/// Known only once the collection is first observed during replay; cached
/// for the life of the parse session. `kind_tag` preserves the raw wire tag
/// so unknown kinds stay diagnosable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: CollectionName,
    pub kind: CollectionKind,
    pub kind_tag: String,
    /// Declared key type name; `None` for queue-like kinds.
    pub key_type: Option<String>,
    /// Declared value type name.
    pub value_type: String,
}

/// One logged operation against one collection.
///
/// Keys and values are raw encoded bytes; their type names are declared once
/// per collection by `CreateCollection` and resolved through the
/// [`TypeRegistry`](crate::values::TypeRegistry).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CollectionOperation {
    CreateCollection {
        name: CollectionName,
        kind: String,
        key_type: Option<String>,
        value_type: String,
    },
    Insert {
        name: CollectionName,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Update {
        name: CollectionName,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Remove {
        name: CollectionName,
        key: Vec<u8>,
    },
    Clear {
        name: CollectionName,
    },
    Enqueue {
        name: CollectionName,
        value: Vec<u8>,
    },
    Dequeue {
        name: CollectionName,
    },
}

impl CollectionOperation {
    /// The collection this operation targets.
    pub fn collection(&self) -> &CollectionName {
        match self {
            CollectionOperation::CreateCollection { name, .. }
            | CollectionOperation::Insert { name, .. }
            | CollectionOperation::Update { name, .. }
            | CollectionOperation::Remove { name, .. }
            | CollectionOperation::Clear { name }
            | CollectionOperation::Enqueue { name, .. }
            | CollectionOperation::Dequeue { name } => name,
        }
    }
}

/// One committed transaction as stored in a segment log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub timestamp: Timestamp,
    pub operations: Vec<CollectionOperation>,
}

/// One atomic mutation observed on one collection.
///
/// Payload shape depends on the collection kind: dictionary events carry a
/// key, queue events do not; removals carry the removed value when the store
/// had it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ItemChange {
    Added {
        key: Option<Value>,
        value: Value,
    },
    Updated {
        key: Value,
        value: Value,
    },
    Removed {
        key: Option<Value>,
        value: Option<Value>,
    },
    Cleared,
}

/// A low-level change event, tagged with the collection it mutated and the
/// kind resolved for that collection. Produced by the store during replay,
/// consumed immediately by the change collector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub kind: CollectionKind,
    pub change: ItemChange,
}

/// All changes one transaction made to one collection, in event order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionChanges {
    pub collection: CollectionName,
    pub kind: CollectionKind,
    pub changes: Vec<ItemChange>,
}

/// The complete delta of one committed transaction.
///
/// Contains exactly one [`CollectionChanges`] per collection the transaction
/// touched, in first-touched order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionChangeSet {
    pub transaction_id: TransactionId,
    pub timestamp: Timestamp,
    pub collections: Vec<CollectionChanges>,
}

impl TransactionChangeSet {
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Changes for one collection, if the transaction touched it.
    pub fn collection(&self, name: &CollectionName) -> Option<&CollectionChanges> {
        self.collections.iter().find(|c| &c.collection == name)
    }
}

/// Summary of one live collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: CollectionName,
    pub kind: CollectionKind,
    pub len: usize,
}
