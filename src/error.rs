//! Error types for petfence.
//!
//! All errors in petfence are strongly typed using thiserror.
//! Per-entity monitoring tasks contain their own failures; these types
//! surface only on the synchronous edges (zone edits, position reports,
//! start/stop calls) and in logs.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::entity::EntityId;
use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Entity id cannot be empty")]
    EmptyEntityId,

    #[error("Entity id exceeds maximum length of {max_length}")]
    EntityIdTooLong {
        max_length: usize,
    },

    #[error("Entity id contains control characters")]
    EntityIdControlChars,

    #[error("Coordinate ({lat}, {lng}) is out of range or not finite")]
    InvalidCoordinate {
        lat: f64,
        lng: f64,
    },

    #[error("Zone radius {radius} must be a finite value greater than zero")]
    InvalidRadius {
        radius: f64,
    },

    #[error("Sample for '{actual}' was routed to '{expected}'")]
    EntityMismatch {
        expected: EntityId,
        actual: EntityId,
    },

    #[error("Sample captured at {captured_at} is more than {max_skew_ms}ms ahead of the local clock")]
    SampleFromFuture {
        captured_at: DateTime<Utc>,
        max_skew_ms: u64,
    },

    #[error("Invalid configuration field '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },
}

/// Execution errors that occur while running the monitoring core.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout {
        operation: String,
        duration_ms: u64,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Notification dispatch failed: {message}")]
    Notification {
        message: String,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Entity {entity_id} is not being monitored")]
    NotMonitored {
        entity_id: EntityId,
    },

    #[error("Entity {entity_id} is already being monitored")]
    AlreadyMonitored {
        entity_id: EntityId,
    },

    #[error("Zone for {entity_id} is unavailable: {reason}")]
    ZoneUnavailable {
        entity_id: EntityId,
        reason: String,
    },

    #[error("Monitoring task failed: {message}")]
    TaskFailed {
        message: String,
    },
}

/// Top-level error type for petfence.
#[derive(Debug, Error)]
pub enum FenceError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl FenceError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a timeout error for the named operation.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Execution(ExecutionError::Timeout {
            operation: operation.into(),
            duration_ms: duration.as_millis().min(u128::from(u64::MAX)) as u64,
        })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. }
                    | ExecutionError::Storage { .. }
                    | ExecutionError::Notification { .. }
                    | ExecutionError::ZoneUnavailable { .. }
            ),
            Self::Internal { .. } => false,
        }
    }
}

impl From<StorageError> for FenceError {
    fn from(err: StorageError) -> Self {
        Self::Execution(ExecutionError::Storage {
            message: err.to_string(),
        })
    }
}

/// Result type alias for petfence operations.
pub type FenceResult<T> = Result<T, FenceError>;
