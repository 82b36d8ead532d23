//! Segment transaction logs.
//!
//! A segment log is a framed, append-only sequence of committed
//! transactions: magic + version header, then one frame per transaction
//! (u32 LE length, MessagePack record, u32 LE CRC32). The writer hashes
//! every byte it emits so the manifest digest is computed without a second
//! pass; the reader verifies the digest before yielding anything.

use crate::chain::manifest::{SegmentKind, SegmentManifest, SEGMENT_LOG_FILE};
use crate::error::{EngineError, Result};
use crate::types::{LogDigest, Timestamp, TransactionRecord};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for segment log files.
const SEGMENT_MAGIC: &[u8; 4] = b"RCL\0";

/// Current segment log format version.
const SEGMENT_VERSION: u8 = 1;

/// Sanity limit on one framed transaction record.
const MAX_RECORD_BYTES: usize = 100 * 1024 * 1024;

/// Writes one segment directory: framed log plus manifest.
pub struct SegmentWriter {
    dir: PathBuf,
    kind: SegmentKind,
    sequence: u64,
    writer: BufWriter<File>,
    hasher: Sha256,
    transactions: u64,
}

impl SegmentWriter {
    /// Create a new segment directory and open its log for writing.
    pub fn create(dir: impl AsRef<Path>, kind: SegmentKind, sequence: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(SEGMENT_LOG_FILE))?;

        let mut writer = Self {
            dir,
            kind,
            sequence,
            writer: BufWriter::new(file),
            hasher: Sha256::new(),
            transactions: 0,
        };
        writer.write_bytes(SEGMENT_MAGIC)?;
        writer.write_bytes(&[SEGMENT_VERSION])?;
        Ok(writer)
    }

    /// Append one committed transaction to the log.
    pub fn append(&mut self, record: &TransactionRecord) -> Result<()> {
        let encoded = rmp_serde::to_vec(record)?;

        self.write_bytes(&(encoded.len() as u32).to_le_bytes())?;
        self.write_bytes(&encoded)?;
        self.write_bytes(&crc32fast::hash(&encoded).to_le_bytes())?;

        self.transactions += 1;
        Ok(())
    }

    /// Flush, fsync, and write the manifest. Returns the manifest.
    pub fn finalize(mut self) -> Result<SegmentManifest> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let manifest = SegmentManifest {
            kind: self.kind,
            sequence: self.sequence,
            transactions: self.transactions,
            log_digest: LogDigest(self.hasher.finalize().into()),
            created: Timestamp::now(),
        };
        manifest.write_to(&self.dir)?;
        Ok(manifest)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        Ok(())
    }
}

/// Reads one segment directory, verifying manifest and digest up front.
///
/// Iterates `Result<TransactionRecord>` in log order.
pub struct SegmentReader {
    dir: PathBuf,
    manifest: SegmentManifest,
    reader: BufReader<File>,
    remaining: u64,
}

impl SegmentReader {
    /// Open a segment, verify its log digest against the manifest, and
    /// position the reader at the first transaction.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let manifest = SegmentManifest::read_from(&dir)?;

        let log_path = dir.join(SEGMENT_LOG_FILE);
        verify_digest(&log_path, &manifest.log_digest, &dir)?;

        let mut reader = BufReader::new(File::open(&log_path)?);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| corrupt(&dir, "segment log too short"))?;
        if &magic != SEGMENT_MAGIC {
            return Err(corrupt(&dir, "bad segment log magic"));
        }

        let mut version = [0u8; 1];
        reader
            .read_exact(&mut version)
            .map_err(|_| corrupt(&dir, "segment log too short"))?;
        if version[0] != SEGMENT_VERSION {
            return Err(corrupt(
                &dir,
                &format!("unsupported segment log version {}", version[0]),
            ));
        }

        let remaining = manifest.transactions;
        Ok(Self {
            dir,
            manifest,
            reader,
            remaining,
        })
    }

    pub fn manifest(&self) -> &SegmentManifest {
        &self.manifest
    }

    fn read_record(&mut self) -> Result<TransactionRecord> {
        let mut len_bytes = [0u8; 4];
        self.reader
            .read_exact(&mut len_bytes)
            .map_err(|_| corrupt(&self.dir, "segment log truncated"))?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_RECORD_BYTES {
            return Err(corrupt(&self.dir, "transaction record too large"));
        }

        let mut encoded = vec![0u8; len];
        self.reader
            .read_exact(&mut encoded)
            .map_err(|_| corrupt(&self.dir, "segment log truncated"))?;

        let mut checksum_bytes = [0u8; 4];
        self.reader
            .read_exact(&mut checksum_bytes)
            .map_err(|_| corrupt(&self.dir, "segment log truncated"))?;
        let stored = u32::from_le_bytes(checksum_bytes);
        if stored != crc32fast::hash(&encoded) {
            return Err(corrupt(&self.dir, "transaction record checksum mismatch"));
        }

        rmp_serde::from_slice(&encoded)
            .map_err(|e| corrupt(&self.dir, &format!("bad transaction record: {}", e)))
    }
}

impl Iterator for SegmentReader {
    type Item = Result<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.read_record())
    }
}

fn verify_digest(log_path: &Path, expected: &LogDigest, dir: &Path) -> Result<()> {
    let mut file = File::open(log_path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let actual = LogDigest(hasher.finalize().into());

    if actual != *expected {
        return Err(corrupt(dir, "segment log digest mismatch"));
    }
    Ok(())
}

fn corrupt(dir: &Path, detail: &str) -> EngineError {
    EngineError::CorruptChain(format!("{} ({})", detail, dir.display()))
}
