//! Great-circle math and circular safe zones.
//!
//! Distances use the haversine formula on a sphere of mean Earth radius.
//! Nothing here validates its inputs: coordinates reaching these functions
//! have already been checked at the feed and zone-edit boundaries, and the
//! result for non-finite input is unspecified.

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::error::ValidationError;

/// Mean Earth radius (IUGG), in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// A WGS84 latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees, [-90, 90].
    pub lat: f64,
    /// Longitude in degrees, [-180, 180].
    pub lng: f64,
}

impl Coordinate {
    /// Creates a coordinate without range checks.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Creates a coordinate, rejecting non-finite or out-of-range values.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidCoordinate` when the pair is unusable.
    pub fn validated(lat: f64, lng: f64) -> Result<Self, ValidationError> {
        let coord = Self { lat, lng };
        if coord.is_valid() {
            Ok(coord)
        } else {
            Err(ValidationError::InvalidCoordinate { lat, lng })
        }
    }

    /// Returns true if both components are finite and within range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Great-circle distance between two coordinates, in meters.
#[must_use]
pub fn distance_meters(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push h a hair above 1 for antipodal points.
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_METERS * c
}

/// Boundary-inclusive containment test.
#[must_use]
pub fn is_inside(position: Coordinate, zone: &SafeZone) -> bool {
    distance_meters(position, zone.center) <= zone.radius_meters
}

/// The circular area an entity is allowed to roam in.
///
/// One active zone per entity; edits replace the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeZone {
    /// Entity this zone fences.
    pub entity_id: EntityId,
    /// Center of the circle.
    pub center: Coordinate,
    /// Radius in meters, always > 0.
    pub radius_meters: f64,
}

impl SafeZone {
    /// Creates a validated zone.
    ///
    /// # Errors
    /// Rejects invalid centers and radii that are not finite and positive.
    pub fn new(
        entity_id: EntityId,
        center: Coordinate,
        radius_meters: f64,
    ) -> Result<Self, ValidationError> {
        let zone = Self {
            entity_id,
            center,
            radius_meters,
        };
        zone.validate()?;
        Ok(zone)
    }

    /// Re-checks the zone invariants (useful for values read from a store).
    ///
    /// # Errors
    /// Same conditions as [`SafeZone::new`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.center.is_valid() {
            return Err(ValidationError::InvalidCoordinate {
                lat: self.center.lat,
                lng: self.center.lng,
            });
        }
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return Err(ValidationError::InvalidRadius {
                radius: self.radius_meters,
            });
        }
        Ok(())
    }

    /// Distance from the zone center to `position`, in meters.
    #[must_use]
    pub fn distance_to(&self, position: Coordinate) -> f64 {
        distance_meters(position, self.center)
    }

    /// Whether `position` lies within the zone (boundary inclusive).
    #[must_use]
    pub fn contains(&self, position: Coordinate) -> bool {
        is_inside(position, self)
    }
}
