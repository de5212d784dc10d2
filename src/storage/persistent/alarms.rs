//! Durable alarm flag store.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::alerts::AlarmState;
use crate::entity::EntityId;
use crate::storage::traits::{AlarmStore, StorageError};

use super::file_lock::AlarmDirLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "alarms.wal";

fn io_err(context: &str, err: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

/// Alarm flags backed by a write-ahead log in a locked directory.
///
/// Reads are served from memory; every change is appended (and by default
/// fsynced) on the blocking pool before it becomes visible. Readers only
/// ever wait for the in-memory update, never for the disk.
pub struct PersistentAlarmStore {
    dir: PathBuf,
    journal: Arc<Journal>,
    config: PersistentConfig,
    corruption_detected: bool,
    _lock: AlarmDirLock,
}

/// Log plus the armed set it describes.
///
/// `commit` orders appends against compaction; `armed` is only written
/// after the matching record is durable.
struct Journal {
    wal: WriteAheadLog,
    armed: RwLock<BTreeSet<EntityId>>,
    commit: Mutex<()>,
    max_wal_size: u64,
}

impl Journal {
    fn contains(&self, entity_id: &EntityId, context: &'static str) -> Result<bool, StorageError> {
        let armed = self.armed.read().map_err(|_| lock_err(context))?;
        Ok(armed.contains(entity_id))
    }

    fn snapshot(&self, context: &'static str) -> Result<Vec<EntityId>, StorageError> {
        let armed = self.armed.read().map_err(|_| lock_err(context))?;
        Ok(armed.iter().cloned().collect())
    }

    /// Logs and applies one flag change. Blocking.
    fn commit(&self, state: &AlarmState) -> Result<(), StorageError> {
        let _commit = self.commit.lock().map_err(|_| lock_err("alarm.commit"))?;
        if self.contains(&state.entity_id, "alarm.commit")? == state.armed {
            return Ok(());
        }
        let entity_id = state.entity_id.clone();
        let kind = if state.armed {
            WalEntryKind::Armed { entity_id }
        } else {
            WalEntryKind::Disarmed { entity_id }
        };
        self.wal.append(kind).map_err(|e| io_err("append alarm log", &e))?;
        {
            let mut armed = self.armed.write().map_err(|_| lock_err("alarm.commit"))?;
            if state.armed {
                armed.insert(state.entity_id.clone());
            } else {
                armed.remove(&state.entity_id);
            }
        }

        match self.wal.size_bytes() {
            Ok(size) if size > self.max_wal_size => {
                if let Err(e) = self.compact() {
                    warn!(error = %e, "alarm log compaction failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cannot stat alarm log"),
        }
        Ok(())
    }

    /// Rewrites the log as one snapshot. Caller holds `commit`.
    fn compact(&self) -> Result<(), StorageError> {
        let before = self.wal.size_bytes().unwrap_or(0);
        let armed = self.snapshot("alarm.compact")?;
        self.wal
            .rewrite_snapshot(armed)
            .map_err(|e| io_err("compact alarm log", &e))?;
        debug!(before_bytes = before, after_bytes = self.wal.size_bytes().unwrap_or(0), "alarm log compacted");
        Ok(())
    }
}

impl PersistentAlarmStore {
    /// Opens (or creates) the store in `dir` and replays its log.
    ///
    /// # Errors
    /// - The directory cannot be created
    /// - Another process holds the lock
    /// - The log file is not an alarm log
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("create alarm store directory", &e))?;
        let lock = AlarmDirLock::acquire(dir).map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock {
                StorageError::ConnectionError(e.to_string())
            } else {
                io_err("lock alarm store", &e)
            }
        })?;

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write).map_err(|e| {
            if e.kind() == ErrorKind::InvalidData {
                StorageError::Corrupted(e.to_string())
            } else {
                io_err("open alarm log", &e)
            }
        })?;
        let corruption_detected = wal.recovered_from().is_some();

        let mut armed = BTreeSet::new();
        let mut replayed = 0u64;
        for entry in wal.iter().map_err(|e| io_err("read alarm log", &e))? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Open already cut the log at the first bad record.
                    warn!(error = %e, "alarm log replay stopped early");
                    break;
                }
            };
            match entry.kind {
                WalEntryKind::Armed { entity_id } => {
                    armed.insert(entity_id);
                }
                WalEntryKind::Disarmed { entity_id } => {
                    armed.remove(&entity_id);
                }
                WalEntryKind::Snapshot { armed: snapshot } => {
                    armed = snapshot.into_iter().collect();
                }
            }
            replayed += 1;
        }
        info!(dir = %dir.display(), replayed, armed = armed.len(), corruption_detected, "alarm store opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            journal: Arc::new(Journal {
                wal,
                armed: RwLock::new(armed),
                commit: Mutex::new(()),
                max_wal_size: config.max_wal_size,
            }),
            config,
            corruption_detected,
            _lock: lock,
        })
    }

    /// True if the log was damaged and cut back on open.
    #[must_use]
    pub const fn corruption_detected(&self) -> bool {
        self.corruption_detected
    }
}

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

impl std::fmt::Debug for PersistentAlarmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentAlarmStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("corruption_detected", &self.corruption_detected)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AlarmStore for PersistentAlarmStore {
    async fn is_armed(&self, entity_id: &EntityId) -> Result<bool, StorageError> {
        self.journal.contains(entity_id, "alarm.is_armed")
    }

    /// A caller that times out does not cancel the write; it lands once
    /// the disk returns.
    async fn put_alarm(&self, state: &AlarmState) -> Result<(), StorageError> {
        if self.journal.contains(&state.entity_id, "alarm.put")? == state.armed {
            return Ok(());
        }
        let journal = Arc::clone(&self.journal);
        let state = state.clone();
        tokio::task::spawn_blocking(move || journal.commit(&state))
            .await
            .map_err(|e| StorageError::BackendError(format!("alarm log writer failed: {e}")))?
    }

    async fn list_armed(&self) -> Result<Vec<EntityId>, StorageError> {
        self.journal.snapshot("alarm.list")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(name: &str) -> EntityId {
        EntityId::new(name).unwrap()
    }

    #[tokio::test]
    async fn flags_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = PersistentAlarmStore::open(dir.path(), PersistentConfig::default()).unwrap();
            store.put_alarm(&AlarmState::armed(id("rex"))).await.unwrap();
            store.put_alarm(&AlarmState::armed(id("fido"))).await.unwrap();
            store.put_alarm(&AlarmState::disarmed(id("rex"))).await.unwrap();
        }

        let store = PersistentAlarmStore::open(dir.path(), PersistentConfig::default()).unwrap();
        assert!(!store.corruption_detected());
        assert!(store.is_armed(&id("fido")).await.unwrap());
        assert!(!store.is_armed(&id("rex")).await.unwrap());
        assert_eq!(store.list_armed().await.unwrap(), vec![id("fido")]);
    }

    #[tokio::test]
    async fn second_open_is_refused_while_locked() {
        let dir = tempdir().unwrap();
        let _first = PersistentAlarmStore::open(dir.path(), PersistentConfig::default()).unwrap();
        let err = PersistentAlarmStore::open(dir.path(), PersistentConfig::default()).unwrap_err();
        assert!(matches!(err, StorageError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn unchanged_flag_is_not_logged() {
        let dir = tempdir().unwrap();
        let store = PersistentAlarmStore::open(dir.path(), PersistentConfig::default()).unwrap();
        store.put_alarm(&AlarmState::disarmed(id("rex"))).await.unwrap();
        store.put_alarm(&AlarmState::armed(id("rex"))).await.unwrap();
        store.put_alarm(&AlarmState::armed(id("rex"))).await.unwrap();
        assert_eq!(store.journal.wal.current_sequence(), 1);
    }

    #[tokio::test]
    async fn stalled_write_leaves_readers_and_timeouts_working() {
        let dir = tempdir().unwrap();
        let store = PersistentAlarmStore::open(dir.path(), PersistentConfig::default()).unwrap();
        store.put_alarm(&AlarmState::armed(id("fido"))).await.unwrap();

        // Hold the commit path the way a hung fsync would.
        let stalled = store.journal.commit.lock().unwrap();
        let write = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.put_alarm(&AlarmState::armed(id("rex"))),
        )
        .await;
        assert!(write.is_err());
        assert!(store.is_armed(&id("fido")).await.unwrap());
        assert_eq!(store.list_armed().await.unwrap(), vec![id("fido")]);
        drop(stalled);

        store.put_alarm(&AlarmState::armed(id("rex"))).await.unwrap();
        assert!(store.is_armed(&id("rex")).await.unwrap());
        assert_eq!(store.journal.wal.current_sequence(), 2);
    }

    #[tokio::test]
    async fn log_is_compacted_past_threshold() {
        let dir = tempdir().unwrap();
        let config = PersistentConfig {
            max_wal_size: 4 * 1024,
            sync_on_write: false,
        };
        {
            let store = PersistentAlarmStore::open(dir.path(), config.clone()).unwrap();
            for i in 0..200 {
                let state = if i % 2 == 0 {
                    AlarmState::armed(id("rex"))
                } else {
                    AlarmState::disarmed(id("rex"))
                };
                store.put_alarm(&state).await.unwrap();
            }
            store.put_alarm(&AlarmState::armed(id("fido"))).await.unwrap();
            assert!(store.journal.wal.size_bytes().unwrap() <= 4 * 1024 + 512);
        }

        let store = PersistentAlarmStore::open(dir.path(), config).unwrap();
        assert_eq!(store.list_armed().await.unwrap(), vec![id("fido")]);
    }
}
