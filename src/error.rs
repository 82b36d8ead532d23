//! Error types for the replay engine.

use crate::types::{CollectionKind, CollectionName};
use std::time::Duration;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid chain sequence: {0}")]
    InvalidChainSequence(String),

    #[error("Corrupt backup chain: {0}")]
    CorruptChain(String),

    #[error("Unsupported collection kind {kind:?} for {collection}")]
    UnsupportedCollectionKind {
        collection: CollectionName,
        kind: String,
    },

    #[error("Parse already started; an engine replays its chain once")]
    AlreadyParsing,

    #[error("State is read-only until parsing completes")]
    WriteBeforeParseComplete,

    #[error("Backup timed out after {0:?}")]
    BackupTimedOut(Duration),

    #[error("Backup cancelled")]
    BackupCancelled,

    #[error("Incremental backup requires a prior kept backup")]
    NoBaselineBackup,

    #[error("Engine has been closed")]
    Closed,

    #[error("Collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("Collection already exists: {0}")]
    CollectionExists(CollectionName),

    #[error("Duplicate key {key} in {collection}")]
    DuplicateKey {
        collection: CollectionName,
        key: String,
    },

    #[error("Key {key} not found in {collection}")]
    KeyNotFound {
        collection: CollectionName,
        key: String,
    },

    #[error("Queue {0} is empty")]
    EmptyQueue(CollectionName),

    #[error("Collection kind mismatch for {collection}: expected {expected:?}, got {actual:?}")]
    KindMismatch {
        collection: CollectionName,
        expected: CollectionKind,
        actual: CollectionKind,
    },

    #[error("Value type mismatch for {collection}: expected {expected}, got {got}")]
    TypeMismatch {
        collection: CollectionName,
        expected: String,
        got: String,
    },

    #[error("Transaction has no operations")]
    EmptyTransaction,

    #[error("Backup root is locked by another process")]
    Locked,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
