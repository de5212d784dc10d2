//! Abstract storage traits for petfence.
//!
//! These traits define the contract the surrounding app implements for
//! its remote and durable stores. By using traits, we enable:
//! - In-memory backends for testing and embedded use
//! - A durable file-backed alarm store for single-device deployments
//! - Cloud document stores behind the app's own adapters
//!
//! Every store only needs read-after-write consistency per entity key.

use async_trait::async_trait;
use thiserror::Error;

use crate::alerts::AlarmState;
use crate::entity::EntityId;
use crate::events::TransitionEvent;
use crate::geo::SafeZone;
use crate::position::PositionSample;
use crate::status::StatusRecord;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key not found where one was required.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed or the store is unreachable.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Stored data failed an integrity check.
    #[error("Corrupted data: {0}")]
    Corrupted(String),
}

/// Remote store holding the active safe zone per entity.
#[async_trait]
pub trait ZoneBackend: Send + Sync {
    /// Reads the active zone, `None` if the owner never configured one.
    async fn fetch_zone(&self, entity_id: &EntityId) -> Result<Option<SafeZone>, StorageError>;

    /// Replaces the active zone.
    async fn store_zone(&self, zone: &SafeZone) -> Result<(), StorageError>;
}

/// Shared store of last known positions, written by the entity's own device.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Reads the last known position.
    async fn latest_position(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<PositionSample>, StorageError>;
}

/// Shared status store read by dashboards and other devices.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Overwrites the current status record for the entity.
    async fn put_status(&self, record: &StatusRecord) -> Result<(), StorageError>;

    /// Appends a transition to the entity's event log.
    async fn append_event(&self, event: &TransitionEvent) -> Result<(), StorageError>;

    /// Reads the current status record.
    async fn get_status(&self, entity_id: &EntityId) -> Result<Option<StatusRecord>, StorageError>;
}

/// Durable per-entity alarm flags that survive process restarts.
#[async_trait]
pub trait AlarmStore: Send + Sync {
    /// Reads the flag; entities never written read as disarmed.
    async fn is_armed(&self, entity_id: &EntityId) -> Result<bool, StorageError>;

    /// Writes the flag.
    async fn put_alarm(&self, state: &AlarmState) -> Result<(), StorageError>;

    /// Lists every entity whose flag is currently armed.
    async fn list_armed(&self) -> Result<Vec<EntityId>, StorageError>;
}
