//! Segment manifests.
//!
//! Every segment directory carries a MANIFEST describing its place in the
//! chain (kind + sequence), how many transactions its log holds, and the
//! SHA-256 digest of the log bytes. Restore refuses a segment whose log no
//! longer matches its manifest.

use crate::error::{EngineError, Result};
use crate::types::{LogDigest, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes for manifest files.
const MANIFEST_MAGIC: &[u8; 4] = b"RCM\0";

/// Current manifest format version.
const MANIFEST_VERSION: u8 = 1;

/// Manifest file name inside a segment directory.
pub const MANIFEST_FILE: &str = "MANIFEST";

/// Transaction log file name inside a segment directory.
pub const SEGMENT_LOG_FILE: &str = "segment.log";

/// Directory name for a segment at the given chain sequence.
pub fn segment_dir_name(sequence: u64) -> String {
    format!("seg-{:06}", sequence)
}

/// Kind of a backup segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Complete state at backup time, expressed as base transactions.
    Full,
    /// Transactions committed since the previous segment.
    Incremental,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Full => write!(f, "full"),
            SegmentKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// Metadata describing one segment of a backup chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub kind: SegmentKind,
    /// Position in the chain; 0 is always the full segment.
    pub sequence: u64,
    /// Number of transaction records in the segment log.
    pub transactions: u64,
    /// SHA-256 of the complete segment log file.
    pub log_digest: LogDigest,
    pub created: Timestamp,
}

impl SegmentManifest {
    /// Write the MANIFEST file into a segment directory.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(MANIFEST_FILE))?;

        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[MANIFEST_VERSION])?;

        let encoded = rmp_serde::to_vec(self)?;
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        file.sync_all()?;
        Ok(())
    }

    /// Read the MANIFEST file from a segment directory.
    pub fn read_from(dir: &Path) -> Result<Self> {
        let mut file = File::open(dir.join(MANIFEST_FILE))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| corrupt(dir, "manifest too short"))?;
        if &magic != MANIFEST_MAGIC {
            return Err(corrupt(dir, "bad manifest magic"));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)
            .map_err(|_| corrupt(dir, "manifest too short"))?;
        if version[0] != MANIFEST_VERSION {
            return Err(corrupt(
                dir,
                &format!("unsupported manifest version {}", version[0]),
            ));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|_| corrupt(dir, "manifest too short"))?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)
            .map_err(|_| corrupt(dir, "manifest truncated"))?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)
            .map_err(|_| corrupt(dir, "manifest truncated"))?;
        let stored = u32::from_le_bytes(checksum_bytes);
        if stored != crc32fast::hash(&encoded) {
            return Err(corrupt(dir, "manifest checksum mismatch"));
        }

        rmp_serde::from_slice(&encoded).map_err(|e| corrupt(dir, &format!("bad manifest: {}", e)))
    }
}

fn corrupt(dir: &Path, detail: &str) -> EngineError {
    EngineError::CorruptChain(format!("{} ({})", detail, dir.display()))
}
