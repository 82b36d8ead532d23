//! Backup orchestration.
//!
//! A backup is staged into a private temp directory first, then offered to
//! the caller's callback: `true` keeps it (the segment is renamed into the
//! destination chain directory), `false` discards it. Staging lives in a
//! [`tempfile::TempDir`], so every exit path (discard, callback error,
//! timeout, cancellation) removes the staged bytes; a kept segment is
//! renamed in one step and is never observable half-moved.
//!
//! Kept segments accumulate in one destination chain directory per
//! baseline: a kept full backup starts a fresh `chain-<timestamp>`
//! directory at sequence 0 and each kept incremental appends the next
//! sequence, so every destination directory is itself a restorable chain.

use crate::chain::{segment_dir_name, SegmentKind, SegmentWriter, MANIFEST_FILE, SEGMENT_LOG_FILE};
use crate::engine::CancelToken;
use crate::error::{EngineError, Result};
use crate::store::{CollectionStore, CommitPipeline};
use crate::types::{LogDigest, Timestamp};
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// What a new backup should contain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupOption {
    /// The complete current state, synthesized as base transactions.
    Full,
    /// The live transactions committed since the last kept backup.
    Incremental,
}

/// Metadata for a completed backup segment.
#[derive(Clone, Debug)]
pub struct BackupDescriptor {
    /// Segment directory. Points into staging while the keep/discard
    /// callback runs, and at the final chain location once kept.
    pub location: PathBuf,
    pub option: BackupOption,
    /// Position in the destination chain.
    pub sequence: u64,
    pub transactions: u64,
    pub size_bytes: u64,
    pub log_digest: LogDigest,
    pub created: Timestamp,
}

/// Result of one backup request.
#[derive(Debug)]
pub enum BackupOutcome {
    Kept(BackupDescriptor),
    Discarded,
}

/// Stages, offers, and finalizes backups of current state.
pub struct BackupManager {
    backup_root: PathBuf,
    staging_root: PathBuf,
    /// Exclusive lock on the backup root, held from the first backup until
    /// close.
    lock_file: Option<File>,
    /// Destination chain of the current baseline, if a full has been kept.
    chain_dir: Option<PathBuf>,
    next_sequence: u64,
}

impl BackupManager {
    pub fn new(backup_root: PathBuf, staging_root: PathBuf) -> Self {
        Self {
            backup_root,
            staging_root,
            lock_file: None,
            chain_dir: None,
            next_sequence: 0,
        }
    }

    /// Stage a backup, consult `callback`, and keep or discard it.
    pub fn backup(
        &mut self,
        store: &CollectionStore,
        pipeline: &CommitPipeline,
        option: BackupOption,
        timeout: Duration,
        token: &CancelToken,
        callback: &mut dyn FnMut(&BackupDescriptor, &CancelToken) -> Result<bool>,
    ) -> Result<BackupOutcome> {
        if option == BackupOption::Incremental && self.chain_dir.is_none() {
            return Err(EngineError::NoBaselineBackup);
        }

        let deadline = Instant::now() + timeout;
        check_progress(deadline, timeout, token)?;
        self.ensure_lock()?;

        // Capture under the commit gate: the records and the delta
        // watermark describe the same point in time. A transaction
        // committed after capture is in neither, and stays in the delta
        // log for the next incremental.
        let (records, watermark, kind, sequence) = pipeline.quiesce(|| match option {
            BackupOption::Full => (
                store.snapshot_records(),
                store.delta_len(),
                SegmentKind::Full,
                0,
            ),
            BackupOption::Incremental => {
                let records = store.delta_records();
                let watermark = records.len();
                (records, watermark, SegmentKind::Incremental, self.next_sequence)
            }
        });
        check_progress(deadline, timeout, token)?;

        std::fs::create_dir_all(&self.staging_root)?;
        let staging = tempfile::Builder::new()
            .prefix("backup-")
            .tempdir_in(&self.staging_root)?;

        let staged_dir = staging.path().join(segment_dir_name(sequence));
        let mut writer = SegmentWriter::create(&staged_dir, kind, sequence)?;
        for record in &records {
            writer.append(record)?;
        }
        let manifest = writer.finalize()?;
        check_progress(deadline, timeout, token)?;

        let descriptor = BackupDescriptor {
            location: staged_dir.clone(),
            option,
            sequence,
            transactions: manifest.transactions,
            size_bytes: segment_size(&staged_dir)?,
            log_digest: manifest.log_digest,
            created: manifest.created,
        };

        // Callback failure or `false` both fall through to the TempDir
        // drop, which removes the staged segment.
        if !callback(&descriptor, token)? {
            tracing::debug!(option = ?option, sequence, "backup discarded by callback");
            return Ok(BackupOutcome::Discarded);
        }
        check_progress(deadline, timeout, token)?;

        let chain_dir = match option {
            BackupOption::Full => {
                // A kept full is a new baseline; it starts a fresh chain.
                let dir = self
                    .backup_root
                    .join(format!("chain-{}", Timestamp::now().0));
                std::fs::create_dir_all(&dir)?;
                dir
            }
            BackupOption::Incremental => self.chain_dir.clone().expect("baseline checked above"),
        };

        let final_dir = chain_dir.join(segment_dir_name(sequence));
        std::fs::rename(&staged_dir, &final_dir)?;

        self.chain_dir = Some(chain_dir);
        self.next_sequence = sequence + 1;
        store.confirm_baseline(watermark);

        tracing::info!(
            option = ?option,
            sequence,
            transactions = manifest.transactions,
            location = %final_dir.display(),
            "backup kept"
        );
        Ok(BackupOutcome::Kept(BackupDescriptor {
            location: final_dir,
            ..descriptor
        }))
    }

    /// Release the backup-root lock. Idempotent.
    pub fn close(&mut self) {
        self.lock_file = None;
    }

    fn ensure_lock(&mut self) -> Result<()> {
        if self.lock_file.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.backup_root)?;
        let lock_file = File::create(self.backup_root.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| EngineError::Locked)?;
        self.lock_file = Some(lock_file);
        Ok(())
    }
}

fn check_progress(deadline: Instant, timeout: Duration, token: &CancelToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(EngineError::BackupCancelled);
    }
    if Instant::now() >= deadline {
        return Err(EngineError::BackupTimedOut(timeout));
    }
    Ok(())
}

fn segment_size(dir: &Path) -> Result<u64> {
    let manifest = std::fs::metadata(dir.join(MANIFEST_FILE))?.len();
    let log = std::fs::metadata(dir.join(SEGMENT_LOG_FILE))?.len();
    Ok(manifest + log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CommitPipeline;
    use crate::subscriptions::SubscriptionManager;
    use crate::types::{CollectionOperation, TransactionId, TransactionRecord};
    use crate::values::{TypeRegistry, Value};
    use std::sync::Arc;
    use tempfile::TempDir;

    const LONG: Duration = Duration::from_secs(60);

    fn store_with_data() -> (Arc<CollectionStore>, Arc<CommitPipeline>) {
        let store = Arc::new(CollectionStore::new(TypeRegistry::default()));
        let pipeline = Arc::new(CommitPipeline::new(
            Arc::clone(&store),
            Arc::new(SubscriptionManager::new()),
        ));
        let registry = TypeRegistry::default();
        pipeline
            .commit(
                &TransactionRecord {
                    id: TransactionId(1),
                    timestamp: Timestamp::now(),
                    operations: vec![
                        CollectionOperation::CreateCollection {
                            name: "urn:orders".into(),
                            kind: "dictionary".to_string(),
                            key_type: Some("string".to_string()),
                            value_type: "i64".to_string(),
                        },
                        CollectionOperation::Insert {
                            name: "urn:orders".into(),
                            key: registry.encode("string", &Value::from("a")).unwrap(),
                            value: registry.encode("i64", &Value::I64(1)).unwrap(),
                        },
                    ],
                },
                false,
            )
            .unwrap();
        (store, pipeline)
    }

    fn live_insert(pipeline: &CommitPipeline, id: u64, key: &str, value: i64) {
        let registry = TypeRegistry::default();
        pipeline
            .commit(
                &TransactionRecord {
                    id: TransactionId(id),
                    timestamp: Timestamp::now(),
                    operations: vec![CollectionOperation::Insert {
                        name: "urn:orders".into(),
                        key: registry.encode("string", &Value::from(key)).unwrap(),
                        value: registry.encode("i64", &Value::I64(value)).unwrap(),
                    }],
                },
                true,
            )
            .unwrap();
    }

    fn manager(root: &TempDir) -> BackupManager {
        BackupManager::new(
            root.path().join("backups"),
            root.path().join("backups").join(".staging"),
        )
    }

    #[test]
    fn test_kept_backup_lands_in_chain_dir() {
        let root = TempDir::new().unwrap();
        let (store, pipeline) = store_with_data();
        let mut manager = manager(&root);

        let outcome = manager
            .backup(
                &store,
                &pipeline,
                BackupOption::Full,
                LONG,
                &CancelToken::new(),
                &mut |descriptor, _| {
                    assert!(descriptor.location.exists());
                    Ok(true)
                },
            )
            .unwrap();

        match outcome {
            BackupOutcome::Kept(descriptor) => {
                assert!(descriptor.location.exists());
                assert_eq!(descriptor.sequence, 0);
                assert_eq!(descriptor.transactions, 1);
                assert!(descriptor.size_bytes > 0);
            }
            other => panic!("expected Kept, got {:?}", other),
        }
    }

    #[test]
    fn test_discarded_backup_leaves_no_trace() {
        let root = TempDir::new().unwrap();
        let (store, pipeline) = store_with_data();
        let mut manager = manager(&root);

        let mut staged_location = PathBuf::new();
        let outcome = manager
            .backup(
                &store,
                &pipeline,
                BackupOption::Full,
                LONG,
                &CancelToken::new(),
                &mut |descriptor, _| {
                    staged_location = descriptor.location.clone();
                    Ok(false)
                },
            )
            .unwrap();

        assert!(matches!(outcome, BackupOutcome::Discarded));
        assert!(!staged_location.exists());
        // Nothing reachable under the backup root except lock + staging.
        let entries: Vec<_> = std::fs::read_dir(root.path().join("backups"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.') && n != "LOCK")
            .collect();
        assert!(entries.is_empty(), "unexpected entries: {:?}", entries);
    }

    #[test]
    fn test_incremental_without_baseline() {
        let root = TempDir::new().unwrap();
        let (store, pipeline) = store_with_data();
        let mut manager = manager(&root);

        let result = manager.backup(
            &store,
            &pipeline,
            BackupOption::Incremental,
            LONG,
            &CancelToken::new(),
            &mut |_, _| Ok(true),
        );
        assert!(matches!(result, Err(EngineError::NoBaselineBackup)));
    }

    #[test]
    fn test_discarded_full_does_not_establish_baseline() {
        let root = TempDir::new().unwrap();
        let (store, pipeline) = store_with_data();
        let mut manager = manager(&root);

        manager
            .backup(
                &store,
                &pipeline,
                BackupOption::Full,
                LONG,
                &CancelToken::new(),
                &mut |_, _| Ok(false),
            )
            .unwrap();

        let result = manager.backup(
            &store,
            &pipeline,
            BackupOption::Incremental,
            LONG,
            &CancelToken::new(),
            &mut |_, _| Ok(true),
        );
        assert!(matches!(result, Err(EngineError::NoBaselineBackup)));
    }

    #[test]
    fn test_incremental_appends_to_chain() {
        let root = TempDir::new().unwrap();
        let (store, pipeline) = store_with_data();
        let mut manager = manager(&root);

        manager
            .backup(
                &store,
                &pipeline,
                BackupOption::Full,
                LONG,
                &CancelToken::new(),
                &mut |_, _| Ok(true),
            )
            .unwrap();

        live_insert(&pipeline, 2, "b", 2);

        let outcome = manager
            .backup(
                &store,
                &pipeline,
                BackupOption::Incremental,
                LONG,
                &CancelToken::new(),
                &mut |_, _| Ok(true),
            )
            .unwrap();

        match outcome {
            BackupOutcome::Kept(descriptor) => {
                assert_eq!(descriptor.sequence, 1);
                assert_eq!(descriptor.transactions, 1);
            }
            other => panic!("expected Kept, got {:?}", other),
        }
        // Keeping the incremental advanced the baseline.
        assert!(store.delta_records().is_empty());
    }

    #[test]
    fn test_commit_during_keep_decision_stays_in_delta() {
        let root = TempDir::new().unwrap();
        let (store, pipeline) = store_with_data();
        let mut manager = manager(&root);

        // The commit lands after the full backup's content was captured
        // but before the callback keeps it.
        let committer = Arc::clone(&pipeline);
        manager
            .backup(
                &store,
                &pipeline,
                BackupOption::Full,
                LONG,
                &CancelToken::new(),
                &mut |_, _| {
                    live_insert(&committer, 2, "late", 9);
                    Ok(true)
                },
            )
            .unwrap();

        // The kept full does not contain it, so the delta must still.
        let remaining = store.delta_records();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, TransactionId(2));

        let outcome = manager
            .backup(
                &store,
                &pipeline,
                BackupOption::Incremental,
                LONG,
                &CancelToken::new(),
                &mut |_, _| Ok(true),
            )
            .unwrap();
        match outcome {
            BackupOutcome::Kept(descriptor) => assert_eq!(descriptor.transactions, 1),
            other => panic!("expected Kept, got {:?}", other),
        }
        assert!(store.delta_records().is_empty());
    }

    #[test]
    fn test_cancelled_token_surfaces_cancellation() {
        let root = TempDir::new().unwrap();
        let (store, pipeline) = store_with_data();
        let mut manager = manager(&root);

        let token = CancelToken::new();
        token.cancel();
        let result = manager.backup(
            &store,
            &pipeline,
            BackupOption::Full,
            LONG,
            &token,
            &mut |_, _| Ok(true),
        );
        assert!(matches!(result, Err(EngineError::BackupCancelled)));
    }

    #[test]
    fn test_zero_timeout_times_out() {
        let root = TempDir::new().unwrap();
        let (store, pipeline) = store_with_data();
        let mut manager = manager(&root);

        let result = manager.backup(
            &store,
            &pipeline,
            BackupOption::Full,
            Duration::ZERO,
            &CancelToken::new(),
            &mut |_, _| Ok(true),
        );
        assert!(matches!(result, Err(EngineError::BackupTimedOut(_))));
    }

    #[test]
    fn test_callback_error_cleans_staging() {
        let root = TempDir::new().unwrap();
        let (store, pipeline) = store_with_data();
        let mut manager = manager(&root);

        let mut staged_location = PathBuf::new();
        let result = manager.backup(
            &store,
            &pipeline,
            BackupOption::Full,
            LONG,
            &CancelToken::new(),
            &mut |descriptor, _| {
                staged_location = descriptor.location.clone();
                Err(EngineError::BackupCancelled)
            },
        );
        assert!(matches!(result, Err(EngineError::BackupCancelled)));
        assert!(!staged_location.exists());
    }
}
