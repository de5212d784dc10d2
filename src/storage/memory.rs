//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.
//! Each store can simulate connectivity loss (`set_offline`) and slow links
//! (`set_latency`) so callers can exercise their timeout and fallback paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::alerts::AlarmState;
use crate::entity::EntityId;
use crate::events::TransitionEvent;
use crate::geo::SafeZone;
use crate::position::PositionSample;
use crate::status::StatusRecord;
use crate::storage::traits::{AlarmStore, PositionStore, StatusStore, StorageError, ZoneBackend};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Simulated link conditions shared by the in-memory stores.
#[derive(Debug, Default)]
struct LinkConditions {
    offline: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl LinkConditions {
    async fn pass(&self, context: &'static str) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::Acquire) {
            return Err(StorageError::ConnectionError(format!("{context}: store offline")));
        }
        Ok(())
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn set_latency(&self, latency: Duration) {
        let ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
        self.latency_ms.store(ms, Ordering::Relaxed);
    }
}

macro_rules! link_controls {
    ($ty:ty) => {
        impl $ty {
            /// Simulates (or ends) a connectivity outage.
            pub fn set_offline(&self, offline: bool) {
                self.link.set_offline(offline);
            }

            /// Delays every call by `latency`.
            pub fn set_latency(&self, latency: Duration) {
                self.link.set_latency(latency);
            }

            /// Number of calls made against this store, including failed ones.
            #[must_use]
            pub fn calls(&self) -> u64 {
                self.link.calls.load(Ordering::Relaxed)
            }
        }
    };
}

/// Thread-safe in-memory zone back-end.
#[derive(Debug, Default)]
pub struct InMemoryZoneBackend {
    zones: RwLock<HashMap<EntityId, SafeZone>>,
    link: LinkConditions,
}

impl InMemoryZoneBackend {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a zone directly, bypassing link conditions (an edit from another device).
    pub fn insert(&self, zone: SafeZone) -> Result<(), StorageError> {
        let mut zones = self.zones.write().map_err(|_| lock_err("zone.insert"))?;
        zones.insert(zone.entity_id.clone(), zone);
        Ok(())
    }

    /// Removes a zone directly, bypassing link conditions.
    pub fn remove(&self, entity_id: &EntityId) -> Result<Option<SafeZone>, StorageError> {
        let mut zones = self.zones.write().map_err(|_| lock_err("zone.remove"))?;
        Ok(zones.remove(entity_id))
    }

    /// Reads a zone directly, bypassing link conditions.
    pub fn peek(&self, entity_id: &EntityId) -> Result<Option<SafeZone>, StorageError> {
        let zones = self.zones.read().map_err(|_| lock_err("zone.peek"))?;
        Ok(zones.get(entity_id).cloned())
    }
}

link_controls!(InMemoryZoneBackend);

#[async_trait]
impl ZoneBackend for InMemoryZoneBackend {
    async fn fetch_zone(&self, entity_id: &EntityId) -> Result<Option<SafeZone>, StorageError> {
        self.link.pass("zone.fetch").await?;
        self.peek(entity_id)
    }

    async fn store_zone(&self, zone: &SafeZone) -> Result<(), StorageError> {
        self.link.pass("zone.store").await?;
        self.insert(zone.clone())
    }
}

/// Thread-safe in-memory last-known-position store.
#[derive(Debug, Default)]
pub struct InMemoryPositionStore {
    positions: RwLock<HashMap<EntityId, PositionSample>>,
    link: LinkConditions,
}

impl InMemoryPositionStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample as the entity's device would.
    pub fn put(&self, sample: PositionSample) -> Result<(), StorageError> {
        let mut positions = self.positions.write().map_err(|_| lock_err("position.put"))?;
        positions.insert(sample.entity_id.clone(), sample);
        Ok(())
    }
}

link_controls!(InMemoryPositionStore);

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn latest_position(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<PositionSample>, StorageError> {
        self.link.pass("position.latest").await?;
        let positions = self.positions.read().map_err(|_| lock_err("position.latest"))?;
        Ok(positions.get(entity_id).cloned())
    }
}

#[derive(Debug, Default)]
struct StatusState {
    records: HashMap<EntityId, StatusRecord>,
    events: HashMap<EntityId, Vec<TransitionEvent>>,
}

/// Thread-safe in-memory status store.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    state: RwLock<StatusState>,
    writes: AtomicU64,
    link: LinkConditions,
}

impl InMemoryStatusStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for the entity, bypassing link conditions.
    #[must_use]
    pub fn record(&self, entity_id: &EntityId) -> Option<StatusRecord> {
        self.state.read().ok()?.records.get(entity_id).cloned()
    }

    /// Event log for the entity, oldest first.
    #[must_use]
    pub fn events(&self, entity_id: &EntityId) -> Vec<TransitionEvent> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.events.get(entity_id).cloned())
            .unwrap_or_default()
    }

    /// Number of successful status record writes.
    #[must_use]
    pub fn status_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

link_controls!(InMemoryStatusStore);

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn put_status(&self, record: &StatusRecord) -> Result<(), StorageError> {
        self.link.pass("status.put").await?;
        let mut state = self.state.write().map_err(|_| lock_err("status.put"))?;
        state.records.insert(record.entity_id.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn append_event(&self, event: &TransitionEvent) -> Result<(), StorageError> {
        self.link.pass("status.append_event").await?;
        let mut state = self.state.write().map_err(|_| lock_err("status.append_event"))?;
        state
            .events
            .entry(event.entity_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn get_status(&self, entity_id: &EntityId) -> Result<Option<StatusRecord>, StorageError> {
        self.link.pass("status.get").await?;
        let state = self.state.read().map_err(|_| lock_err("status.get"))?;
        Ok(state.records.get(entity_id).cloned())
    }
}

/// Thread-safe in-memory alarm flag store.
///
/// Not durable by itself; share one instance between two service lifetimes
/// to model a restart in tests.
#[derive(Debug, Default)]
pub struct InMemoryAlarmStore {
    flags: RwLock<HashMap<EntityId, bool>>,
    link: LinkConditions,
}

impl InMemoryAlarmStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a flag directly, bypassing link conditions.
    #[must_use]
    pub fn peek(&self, entity_id: &EntityId) -> bool {
        self.flags
            .read()
            .ok()
            .and_then(|f| f.get(entity_id).copied())
            .unwrap_or(false)
    }
}

link_controls!(InMemoryAlarmStore);

#[async_trait]
impl AlarmStore for InMemoryAlarmStore {
    async fn is_armed(&self, entity_id: &EntityId) -> Result<bool, StorageError> {
        self.link.pass("alarm.is_armed").await?;
        let flags = self.flags.read().map_err(|_| lock_err("alarm.is_armed"))?;
        Ok(flags.get(entity_id).copied().unwrap_or(false))
    }

    async fn put_alarm(&self, state: &AlarmState) -> Result<(), StorageError> {
        self.link.pass("alarm.put").await?;
        let mut flags = self.flags.write().map_err(|_| lock_err("alarm.put"))?;
        if state.armed {
            flags.insert(state.entity_id.clone(), true);
        } else {
            flags.remove(&state.entity_id);
        }
        Ok(())
    }

    async fn list_armed(&self) -> Result<Vec<EntityId>, StorageError> {
        self.link.pass("alarm.list").await?;
        let flags = self.flags.read().map_err(|_| lock_err("alarm.list"))?;
        let mut out: Vec<EntityId> = flags
            .iter()
            .filter(|(_, armed)| **armed)
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        Ok(out)
    }
}

/// A bundle of in-memory stores.
#[allow(missing_docs)]
#[derive(Debug, Default, Clone)]
pub struct InMemoryStores {
    pub zones: Arc<InMemoryZoneBackend>,
    pub positions: Arc<InMemoryPositionStore>,
    pub status: Arc<InMemoryStatusStore>,
    pub alarms: Arc<InMemoryAlarmStore>,
}
