//! # relic
//!
//! Replay engine for reliable-collection backup chains with
//! per-transaction change tracking.
//!
//! A backup chain is one full backup plus zero or more incremental
//! backups. `relic` restores the chain into in-memory collections by
//! replaying its transaction log in causal order, delivering one
//! aggregated changeset per committed transaction to registered observers.
//! Once replay completes the restored state is writable, and a new backup
//! of the result can be taken with a caller-controlled keep/discard
//! decision.
//!
//! ## Core Concepts
//!
//! - **Chain**: segment directories (`MANIFEST` + framed transaction log)
//!   validated up front: exactly one full segment first, contiguous
//!   sequence numbers after it
//! - **Collections**: dictionaries and queues whose key/value types are
//!   declared inside the chain and resolved at replay time through a
//!   [`TypeRegistry`]
//! - **Changesets**: every transaction's item-level changes, grouped per
//!   collection in first-touched order, delivered exactly once
//! - **Backups**: staged locally, then kept or discarded by a callback
//!
//! ## Example
//!
//! ```ignore
//! use relic::{CancelToken, EngineConfig, ReplayEngine, Value};
//!
//! let engine = ReplayEngine::open(EngineConfig {
//!     chain_path: "./chain".into(),
//!     backup_root: "./backups".into(),
//!     ..Default::default()
//! })?;
//!
//! let stream = engine.subscribe_stream(64)?;
//! engine.parse(&CancelToken::new())?;
//!
//! while let Ok(changeset) = stream.try_recv() {
//!     println!("txn {} touched {} collections",
//!         changeset.transaction_id, changeset.collections.len());
//! }
//!
//! // Parse completed: state is writable.
//! let state = engine.state();
//! let mut txn = state.begin_transaction()?;
//! txn.insert("urn:orders", Value::from("a"), Value::I64(1))?;
//! txn.commit()?;
//! ```

pub mod backup;
pub mod chain;
pub mod changes;
pub mod engine;
pub mod error;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod values;

// Re-exports
pub use backup::{BackupDescriptor, BackupManager, BackupOption, BackupOutcome};
pub use chain::{BackupChain, ChainSegment, SegmentKind, SegmentManifest};
pub use changes::{ChangeCollector, ChangeSink, TransactionAggregator};
pub use engine::{CancelToken, EngineConfig, EngineStatus, ParseOutcome, ParseStats, ReplayEngine};
pub use error::{EngineError, Result};
pub use store::{CollectionStore, StateHandle, WriteTransaction};
pub use subscriptions::{SubscriptionId, SubscriptionManager, TransactionStream};
pub use types::*;
pub use values::{TypeRegistry, Value, ValueCodec};
