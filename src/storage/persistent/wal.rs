//! Append-only alarm log.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```
//!
//! On open the log is scanned up to the first torn or corrupt record and
//! cut back to that point, so later appends are never hidden behind garbage.
//! Compaction rewrites the log as a single snapshot record via a temporary
//! file and an atomic rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entity::EntityId;

use super::codec;

/// A single log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing within one log generation.
    pub sequence: u64,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation.
    pub kind: WalEntryKind,
}

/// Mutation recorded in the log.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntryKind {
    Armed { entity_id: EntityId },
    Disarmed { entity_id: EntityId },
    /// Full set of armed entities; replaces everything before it.
    Snapshot { armed: Vec<EntityId> },
}

struct WalWriter {
    file: BufWriter<File>,
    sequence: u64,
}

/// Write-ahead log for alarm flags. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
    recovered_from: Option<String>,
}

fn poisoned() -> std::io::Error {
    std::io::Error::new(ErrorKind::Other, "alarm log mutex poisoned")
}

impl WriteAheadLog {
    /// Opens or creates a log, cutting off any torn or corrupt tail.
    ///
    /// # Errors
    /// I/O failures, or a file that is not an alarm log at all.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let (sequence, recovered_from) = if len < codec::HEADER_LEN {
            // Brand new, or a crash before the header was complete.
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            (0, None)
        } else {
            let scan = Self::scan(path)?;
            if scan.valid_len < len {
                warn!(
                    path = %path.display(),
                    valid_bytes = scan.valid_len,
                    total_bytes = len,
                    reason = scan.error.as_deref().unwrap_or("trailing bytes"),
                    "alarm log damaged; discarding tail"
                );
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
            (scan.last_sequence, scan.error)
        };
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                file: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
            recovered_from,
        })
    }

    /// Appends one record, returning its sequence number.
    ///
    /// # Errors
    /// Serialization or I/O failures; the in-memory sequence is unchanged on error.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        let candidate = writer.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        })?;

        writer.file.write_all(&encoded)?;
        writer.file.flush()?;
        if self.sync_on_write {
            writer.file.get_ref().sync_data()?;
        }
        writer.sequence = candidate;
        Ok(candidate)
    }

    /// Iterates over every valid record.
    ///
    /// # Errors
    /// If the file cannot be opened or its header is invalid.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last record.
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.writer.lock().map(|w| w.sequence).unwrap_or(0)
    }

    /// Log size in bytes.
    ///
    /// # Errors
    /// If the file metadata cannot be read.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Description of the damage found on open, if any.
    #[must_use]
    pub fn recovered_from(&self) -> Option<&str> {
        self.recovered_from.as_deref()
    }

    /// Atomically replaces the whole log with a single snapshot record.
    ///
    /// # Errors
    /// I/O failures; the previous log stays intact if the rename never happened.
    pub fn rewrite_snapshot(&self, armed: Vec<EntityId>) -> IoResult<()> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        writer.file.flush()?;

        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            codec::write_header(&mut tmp)?;
            tmp.write_all(&codec::encode(&WalEntry {
                sequence: 1,
                timestamp: Utc::now(),
                kind: WalEntryKind::Snapshot { armed },
            })?)?;
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            // Persist the rename itself; not every platform can open a directory.
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }

        let file = OpenOptions::new().append(true).open(&self.path)?;
        writer.file = BufWriter::new(file);
        writer.sequence = 1;
        Ok(())
    }

    fn scan(path: &Path) -> IoResult<Scan> {
        let mut iter = WalIterator::new(path)?;
        let mut scan = Scan {
            last_sequence: 0,
            valid_len: iter.position()?,
            error: None,
        };
        loop {
            match iter.next() {
                None => break,
                Some(Ok(entry)) => {
                    scan.last_sequence = entry.sequence;
                    scan.valid_len = iter.position()?;
                }
                Some(Err(e)) => {
                    scan.error = Some(e.to_string());
                    break;
                }
            }
        }
        if scan.error.is_none() && iter.torn {
            scan.error = Some("torn final record".to_string());
        }
        Ok(scan)
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .field("sequence", &self.current_sequence())
            .finish()
    }
}

struct Scan {
    last_sequence: u64,
    valid_len: u64,
    error: Option<String>,
}

/// Iterator over log records; stops silently at a torn final record.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
    torn: bool,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self {
            reader,
            file_size,
            torn: false,
        })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.torn = true;
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rex() -> EntityId {
        EntityId::new("rex").unwrap()
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.wal");
        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(WalEntryKind::Armed { entity_id: rex() }).unwrap();
            wal.append(WalEntryKind::Disarmed { entity_id: rex() }).unwrap();
            assert_eq!(wal.current_sequence(), 2);
        }

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence(), 2);
        assert!(wal.recovered_from().is_none());
        let kinds: Vec<_> = wal.iter().unwrap().map(|e| e.unwrap().kind).collect();
        assert_eq!(
            kinds,
            vec![
                WalEntryKind::Armed { entity_id: rex() },
                WalEntryKind::Disarmed { entity_id: rex() },
            ]
        );
    }

    #[test]
    fn test_torn_tail_is_cut_and_appends_stay_visible() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.wal");
        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(WalEntryKind::Armed { entity_id: rex() }).unwrap();
            wal.append(WalEntryKind::Disarmed { entity_id: rex() }).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 2)
            .unwrap();

        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            assert!(wal.recovered_from().is_some());
            assert_eq!(wal.current_sequence(), 1);
            wal.append(WalEntryKind::Disarmed { entity_id: rex() }).unwrap();
        }

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert!(wal.recovered_from().is_none());
        assert_eq!(wal.iter().unwrap().count(), 2);
    }

    #[test]
    fn test_snapshot_rewrite_replaces_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.wal");
        let wal = WriteAheadLog::open(&path, false).unwrap();
        for _ in 0..10 {
            wal.append(WalEntryKind::Armed { entity_id: rex() }).unwrap();
        }
        let before = wal.size_bytes().unwrap();

        wal.rewrite_snapshot(vec![rex()]).unwrap();
        assert!(wal.size_bytes().unwrap() < before);
        assert_eq!(wal.current_sequence(), 1);
        wal.append(WalEntryKind::Disarmed { entity_id: rex() }).unwrap();

        let kinds: Vec<_> = wal.iter().unwrap().map(|e| e.unwrap().kind).collect();
        assert_eq!(
            kinds,
            vec![
                WalEntryKind::Snapshot { armed: vec![rex()] },
                WalEntryKind::Disarmed { entity_id: rex() },
            ]
        );
    }
}
