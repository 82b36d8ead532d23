//! Replay engine: drives the store across a backup chain.
//!
//! One engine owns one parse session over one chain. Construction wires
//! the store, change tracking, and subscriptions together; `parse` walks
//! the chain in sequence order and commits each logged transaction through
//! the shared pipeline, firing one transaction-applied notification per
//! commit. After a successful parse the state handle becomes writable and
//! new backups of the current state can be taken.

use crate::backup::{BackupDescriptor, BackupManager, BackupOption, BackupOutcome};
use crate::chain::{BackupChain, SegmentReader};
use crate::error::{EngineError, Result};
use crate::store::{CollectionStore, CommitPipeline, StateHandle};
use crate::subscriptions::{SubscriptionId, SubscriptionManager, TransactionStream};
use crate::types::TransactionChangeSet;
use crate::values::TypeRegistry;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Directory holding the backup chain to replay.
    pub chain_path: PathBuf,

    /// Destination root for new backups.
    pub backup_root: PathBuf,

    /// Staging area for backups before keep/discard. `None` stages under
    /// `backup_root/.staging` (same filesystem, so keeping a backup is one
    /// rename).
    pub staging_root: Option<PathBuf>,

    /// Codecs for the value types declared inside the chain.
    pub types: TypeRegistry,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain_path: PathBuf::from("./chain"),
            backup_root: PathBuf::from("./backups"),
            staging_root: None,
            types: TypeRegistry::default(),
        }
    }
}

/// Lifecycle of one engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineStatus {
    Created = 0,
    Parsing = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
    Closed = 5,
}

pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new(status: EngineStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> EngineStatus {
        match self.0.load(Ordering::SeqCst) {
            0 => EngineStatus::Created,
            1 => EngineStatus::Parsing,
            2 => EngineStatus::Completed,
            3 => EngineStatus::Cancelled,
            4 => EngineStatus::Failed,
            _ => EngineStatus::Closed,
        }
    }

    pub(crate) fn store(&self, status: EngineStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    /// Atomically move `from → to`; false if the current status differs.
    pub(crate) fn transition(&self, from: EngineStatus, to: EngineStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Cooperative cancellation token, checked at transaction boundaries.
/// Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters from a completed parse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub segments: u64,
    pub transactions: u64,
}

/// Terminal outcome of `parse`. Cancellation is an outcome, not an error:
/// the caller asked the engine to stop and it did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    Completed(ParseStats),
    Cancelled,
}

/// Replays a backup chain into live collection state.
pub struct ReplayEngine {
    config: EngineConfig,
    store: Arc<CollectionStore>,
    subscriptions: Arc<SubscriptionManager>,
    pipeline: Arc<CommitPipeline>,
    status: Arc<StatusCell>,
    backups: Mutex<BackupManager>,
}

impl ReplayEngine {
    /// Construct an engine over a chain directory.
    ///
    /// The chain itself is validated when `parse` runs; construction only
    /// requires the directory to exist.
    pub fn open(config: EngineConfig) -> Result<Self> {
        if !config.chain_path.is_dir() {
            return Err(EngineError::CorruptChain(format!(
                "chain directory not found: {}",
                config.chain_path.display()
            )));
        }

        let staging_root = config
            .staging_root
            .clone()
            .unwrap_or_else(|| config.backup_root.join(".staging"));
        let backups = Mutex::new(BackupManager::new(config.backup_root.clone(), staging_root));

        let store = Arc::new(CollectionStore::new(config.types.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new());
        let pipeline = Arc::new(CommitPipeline::new(
            Arc::clone(&store),
            Arc::clone(&subscriptions),
        ));

        Ok(Self {
            config,
            store,
            subscriptions,
            pipeline,
            status: Arc::new(StatusCell::new(EngineStatus::Created)),
            backups,
        })
    }

    pub fn status(&self) -> EngineStatus {
        self.status.load()
    }

    // --- Notifications ---

    /// Register an observer called synchronously once per committed
    /// transaction, in commit order.
    ///
    /// The observer runs on the committing thread and blocks it. It may
    /// read live state during the callback but must not mutate it:
    /// starting a write transaction from inside an observer deadlocks on
    /// the commit gate. Subscribing or unsubscribing from inside the
    /// callback is allowed; the change takes effect from the next
    /// delivery.
    pub fn subscribe(
        &self,
        observer: impl Fn(&TransactionChangeSet) -> bool + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        self.check_open()?;
        Ok(self.subscriptions.subscribe(observer))
    }

    /// Register a stream subscription with a bounded buffer. The
    /// forwarding send blocks when the buffer is full, so an undrained
    /// stream throttles replay rather than missing notifications.
    pub fn subscribe_stream(&self, buffer: usize) -> Result<TransactionStream> {
        self.check_open()?;
        Ok(self.subscriptions.subscribe_stream(buffer))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id);
    }

    // --- Parse ---

    /// Replay the whole chain, transaction by transaction.
    ///
    /// Cancellation is checked between transactions; a transaction is
    /// either fully replayed with its notification fired or not started.
    /// An engine parses once: any call outside `Created` fails with
    /// [`AlreadyParsing`](EngineError::AlreadyParsing).
    pub fn parse(&self, token: &CancelToken) -> Result<ParseOutcome> {
        if !self.status.transition(EngineStatus::Created, EngineStatus::Parsing) {
            return Err(match self.status.load() {
                EngineStatus::Closed => EngineError::Closed,
                _ => EngineError::AlreadyParsing,
            });
        }

        let chain = match BackupChain::discover(&self.config.chain_path) {
            Ok(chain) => chain,
            Err(e) => return Err(self.fail(e)),
        };
        tracing::info!(
            chain = %chain.root().display(),
            segments = chain.len(),
            transactions = chain.transactions(),
            "parsing backup chain"
        );

        let mut stats = ParseStats::default();
        for segment in chain.segments() {
            let reader = match SegmentReader::open(&segment.dir) {
                Ok(reader) => reader,
                Err(e) => return Err(self.fail(e)),
            };
            tracing::debug!(
                sequence = segment.manifest.sequence,
                kind = %segment.manifest.kind,
                transactions = segment.manifest.transactions,
                "replaying segment"
            );

            for result in reader {
                if token.is_cancelled() {
                    self.status.store(EngineStatus::Cancelled);
                    tracing::info!(
                        transactions = stats.transactions,
                        "parse cancelled at transaction boundary"
                    );
                    return Ok(ParseOutcome::Cancelled);
                }

                let record = match result {
                    Ok(record) => record,
                    Err(e) => return Err(self.fail(e)),
                };
                if let Err(e) = self.pipeline.commit(&record, false) {
                    return Err(self.fail(replay_fault(e, &segment.dir)));
                }
                stats.transactions += 1;
            }
            stats.segments += 1;
        }

        self.status.store(EngineStatus::Completed);
        tracing::info!(
            segments = stats.segments,
            transactions = stats.transactions,
            "parse completed, state is now writable"
        );
        Ok(ParseOutcome::Completed(stats))
    }

    // --- State Access ---

    /// Handle for reading (and, post-parse, writing) the restored state.
    pub fn state(&self) -> StateHandle {
        StateHandle::new(
            Arc::clone(&self.store),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.status),
        )
    }

    // --- Backup ---

    /// Take a backup of current state and let `callback` decide its fate.
    ///
    /// Only valid once parsing has completed. See
    /// [`BackupManager`](crate::backup::BackupManager) for the staging and
    /// keep/discard semantics.
    pub fn backup(
        &self,
        option: BackupOption,
        timeout: Duration,
        token: &CancelToken,
        mut callback: impl FnMut(&BackupDescriptor, &CancelToken) -> Result<bool>,
    ) -> Result<BackupOutcome> {
        match self.status.load() {
            EngineStatus::Closed => return Err(EngineError::Closed),
            EngineStatus::Completed => {}
            _ => return Err(EngineError::WriteBeforeParseComplete),
        }
        self.backups.lock().backup(
            &self.store,
            &self.pipeline,
            option,
            timeout,
            token,
            &mut callback,
        )
    }

    // --- Disposal ---

    /// Release all resources: subscriptions, backup locks, state access.
    /// Idempotent; every operation after close fails with
    /// [`Closed`](EngineError::Closed).
    pub fn close(&self) {
        if self.status.load() == EngineStatus::Closed {
            return;
        }
        self.status.store(EngineStatus::Closed);
        self.backups.lock().close();
        self.subscriptions.clear();
        tracing::debug!("engine closed");
    }

    fn check_open(&self) -> Result<()> {
        if self.status.load() == EngineStatus::Closed {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn fail(&self, error: EngineError) -> EngineError {
        self.status.store(EngineStatus::Failed);
        tracing::warn!(error = %error, "parse failed");
        error
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// A log-consistency fault during replay (an operation a correctly
/// produced chain can never contain) is corruption, not caller misuse.
fn replay_fault(error: EngineError, dir: &Path) -> EngineError {
    match error {
        EngineError::CollectionNotFound(_)
        | EngineError::CollectionExists(_)
        | EngineError::DuplicateKey { .. }
        | EngineError::KeyNotFound { .. }
        | EngineError::EmptyQueue(_)
        | EngineError::KindMismatch { .. }
        | EngineError::EmptyTransaction => EngineError::CorruptChain(format!(
            "inconsistent transaction log: {} ({})",
            error,
            dir.display()
        )),
        other => other,
    }
}
