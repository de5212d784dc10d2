//! Tracked entity identity.
//!
//! The core never owns or mutates a tracked entity; it only needs a stable
//! key to hang zones, samples, alarm flags and status records on. Account
//! ownership lives outside this crate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Opaque, stable identifier of a tracked entity (a pet collar, a phone).
///
/// # Examples
///
/// ```
/// use petfence::EntityId;
///
/// let id = EntityId::new("rex").unwrap();
/// assert_eq!(id.as_str(), "rex");
/// assert!(EntityId::new("  ").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Maximum length of an entity id in bytes.
    pub const MAX_LENGTH: usize = 128;

    /// Creates a validated entity id. Surrounding whitespace is trimmed.
    ///
    /// # Errors
    /// Returns a validation error for empty, oversized or control-character ids.
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyEntityId);
        }
        if trimmed.len() > Self::MAX_LENGTH {
            return Err(ValidationError::EntityIdTooLong {
                max_length: Self::MAX_LENGTH,
            });
        }
        if trimmed.chars().any(char::is_control) {
            return Err(ValidationError::EntityIdControlChars);
        }
        if trimmed.len() == raw.len() {
            Ok(Self(raw))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
