//! Storage traits and reference backends for petfence.
//!
//! The traits define what the monitoring core needs from the outside world.
//! `memory` provides thread-safe in-memory implementations; `persistent`
//! provides a crash-safe alarm flag store.

mod traits;

/// In-memory reference backends.
pub mod memory;

/// Durable file-backed alarm store.
#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{
    InMemoryAlarmStore, InMemoryPositionStore, InMemoryStatusStore, InMemoryStores,
    InMemoryZoneBackend,
};
#[cfg(feature = "persistent")]
pub use persistent::{open_alarm_store, PersistentAlarmStore, PersistentConfig};
pub use traits::{AlarmStore, PositionStore, StatusStore, StorageError, ZoneBackend};

use std::future::Future;
use std::time::Duration;

use crate::error::{FenceError, FenceResult};

/// Runs a store call with a deadline, mapping both failure modes to `FenceError`.
pub(crate) async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> FenceResult<T>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(FenceError::from),
        Err(_) => Err(FenceError::timeout(operation, limit)),
    }
}
