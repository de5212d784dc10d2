//! Position samples produced by tracking devices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::error::ValidationError;
use crate::geo::Coordinate;

/// One location fix for a tracked entity.
///
/// Samples arrive at irregular intervals, possibly duplicated or out of
/// order; the feed keeps only the newest by `captured_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// Entity the fix belongs to.
    pub entity_id: EntityId,
    /// Reported location.
    pub coordinate: Coordinate,
    /// When the device captured the fix.
    pub captured_at: DateTime<Utc>,
}

impl PositionSample {
    /// Creates a validated sample.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidCoordinate` for malformed coordinates.
    pub fn new(
        entity_id: EntityId,
        lat: f64,
        lng: f64,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            entity_id,
            coordinate: Coordinate::validated(lat, lng)?,
            captured_at,
        })
    }

    /// Creates a validated sample stamped with the current time.
    ///
    /// # Errors
    /// Same as [`PositionSample::new`].
    pub fn now(entity_id: EntityId, lat: f64, lng: f64) -> Result<Self, ValidationError> {
        Self::new(entity_id, lat, lng, Utc::now())
    }

    /// Re-checks a sample built by hand or deserialized from a store.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidCoordinate` for malformed coordinates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.coordinate.is_valid() {
            Ok(())
        } else {
            Err(ValidationError::InvalidCoordinate {
                lat: self.coordinate.lat,
                lng: self.coordinate.lng,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rejects_malformed_coordinates() {
        let id = EntityId::new("rex").unwrap();
        assert!(PositionSample::now(id.clone(), 12.0, 34.0).is_ok());
        assert!(PositionSample::now(id.clone(), f64::NAN, 34.0).is_err());
        assert!(PositionSample::now(id, 12.0, 400.0).is_err());
    }

    #[test]
    fn test_validate_catches_hand_built_sample() {
        let sample = PositionSample {
            entity_id: EntityId::new("rex").unwrap(),
            coordinate: Coordinate::new(-95.0, 0.0),
            captured_at: Utc::now(),
        };
        assert!(sample.validate().is_err());
    }
}
