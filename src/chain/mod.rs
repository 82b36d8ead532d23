//! Backup chain discovery and validation.
//!
//! A chain directory holds one segment directory per backup: exactly one
//! full segment at sequence 0, then incrementals in strictly increasing,
//! contiguous sequence order. Discovery reads every manifest and validates
//! the chain layout before a single transaction is replayed, so structural
//! faults surface up front rather than mid-parse.

pub mod manifest;
pub mod segment;

pub use manifest::{segment_dir_name, SegmentKind, SegmentManifest, MANIFEST_FILE, SEGMENT_LOG_FILE};
pub use segment::{SegmentReader, SegmentWriter};

use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};

/// One discovered segment: its directory plus its parsed manifest.
#[derive(Clone, Debug)]
pub struct ChainSegment {
    pub dir: PathBuf,
    pub manifest: SegmentManifest,
}

/// A validated backup chain, ordered by sequence.
#[derive(Debug)]
pub struct BackupChain {
    root: PathBuf,
    segments: Vec<ChainSegment>,
}

impl BackupChain {
    /// Scan a chain directory and validate its structure.
    ///
    /// Directory entries without a MANIFEST are ignored; a chain with no
    /// segments at all is corrupt. Layout violations (missing full,
    /// multiple fulls, full not first, sequence gap or duplicate) are
    /// [`EngineError::InvalidChainSequence`].
    pub fn discover(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let dir = entry.path();
            if !dir.is_dir() || !dir.join(MANIFEST_FILE).exists() {
                continue;
            }
            let manifest = SegmentManifest::read_from(&dir)?;
            segments.push(ChainSegment { dir, manifest });
        }

        if segments.is_empty() {
            return Err(EngineError::CorruptChain(format!(
                "no segments found in {}",
                root.display()
            )));
        }

        segments.sort_by_key(|s| s.manifest.sequence);
        Self::validate(&segments)?;

        Ok(Self { root, segments })
    }

    fn validate(segments: &[ChainSegment]) -> Result<()> {
        for (position, segment) in segments.iter().enumerate() {
            let sequence = segment.manifest.sequence;
            let expected = position as u64;

            if sequence != expected {
                // Sorted input: a low sequence here is a duplicate, a high
                // one is a gap.
                let fault = if sequence < expected { "duplicate" } else { "missing" };
                let at = sequence.min(expected);
                return Err(EngineError::InvalidChainSequence(format!(
                    "{} sequence number {} ({})",
                    fault,
                    at,
                    segment.dir.display()
                )));
            }

            match segment.manifest.kind {
                SegmentKind::Full if position != 0 => {
                    return Err(EngineError::InvalidChainSequence(format!(
                        "second full segment at sequence {} ({})",
                        sequence,
                        segment.dir.display()
                    )));
                }
                SegmentKind::Incremental if position == 0 => {
                    return Err(EngineError::InvalidChainSequence(format!(
                        "chain starts with an incremental segment ({})",
                        segment.dir.display()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Segments in replay order: the full segment, then each incremental.
    pub fn segments(&self) -> &[ChainSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total committed transactions across all segments, per the manifests.
    pub fn transactions(&self) -> u64 {
        self.segments.iter().map(|s| s.manifest.transactions).sum()
    }
}
