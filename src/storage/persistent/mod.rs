//! Durable alarm flag storage.
//!
//! This module provides a crash-safe [`AlarmStore`](crate::storage::AlarmStore) with:
//! - A write-ahead log of armed/disarmed records
//! - File locking for single-process access
//! - CRC32 checksums for corruption detection
//! - Snapshot compaction once the log grows past a threshold
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           PersistentAlarmStore           │
//! │   in-memory armed set (read path)        │
//! ├──────────────────────────────────────────┤
//! │  blocking pool: commit = append + apply  │
//! │  ┌─────────────────┐                     │
//! │  │ WriteAheadLog   │  alarms.wal         │
//! │  │ (append-only)   │                     │
//! │  └────────┬────────┘                     │
//! │           ↓                              │
//! │  ┌─────────────────────┐                 │
//! │  │ AlarmDirLock (pid)  │  alarms.lock    │
//! │  └─────────────────────┘                 │
//! └──────────────────────────────────────────┘
//! ```

mod alarms;
mod codec;
mod file_lock;
mod wal;

pub use alarms::PersistentAlarmStore;
pub use file_lock::{AlarmDirLock, LOCK_FILE};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{FenceError, ValidationError};

/// Configuration for the durable alarm store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Log size that triggers snapshot compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    /// Below this every write would compact.
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Checks the thresholds.
    ///
    /// # Errors
    /// `InvalidConfig` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, FenceError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                field: "max_wal_size".to_string(),
                reason: format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            }
            .into());
        }
        Ok(self)
    }
}

/// Opens or creates a durable alarm store in `path`.
///
/// # Errors
/// - Invalid configuration
/// - The directory cannot be created or accessed
/// - Another process holds the lock
/// - The log file is not an alarm log
///
/// # Example
/// ```rust,ignore
/// use petfence::storage::{open_alarm_store, AlarmStore};
///
/// let alarms = Arc::new(open_alarm_store("./petfence-data", None)?);
/// let service = MonitorService::builder()
///     .alarm_store(alarms)
///     // ...
///     .build()?;
/// ```
pub fn open_alarm_store(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentAlarmStore, FenceError> {
    let cfg = config.unwrap_or_default().validate()?;
    Ok(PersistentAlarmStore::open(path.as_ref(), cfg)?)
}
