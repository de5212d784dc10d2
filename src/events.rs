//! Transition event types.
//!
//! These types are serializable so they can be appended to the shared event
//! log and streamed to observers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityId;

/// Unique identifier for a transition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a confirmed boundary crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionKind {
    /// The entity came back inside its zone.
    Enter,
    /// The entity left its zone (or was first seen outside it).
    Exit,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enter => f.write_str("ENTER"),
            Self::Exit => f.write_str("EXIT"),
        }
    }
}

/// A confirmed containment flip for one entity.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub event_id: EventId,
    pub entity_id: EntityId,
    pub kind: TransitionKind,
    /// When the flip was detected.
    pub occurred_at: DateTime<Utc>,
    /// Capture time of the sample that confirmed the flip.
    pub sample_at: DateTime<Utc>,
    /// Distance from the zone center at detection.
    pub distance_meters: f64,
}

impl TransitionEvent {
    /// Builds an event stamped with the sample time that caused it.
    #[must_use]
    pub fn new(
        entity_id: EntityId,
        kind: TransitionKind,
        sample_at: DateTime<Utc>,
        distance_meters: f64,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            entity_id,
            kind,
            occurred_at: Utc::now(),
            sample_at,
            distance_meters,
        }
    }

    /// Returns true for EXIT events.
    #[must_use]
    pub const fn is_exit(&self) -> bool {
        matches!(self.kind, TransitionKind::Exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_kind_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&TransitionKind::Exit).unwrap(), "\"EXIT\"");
        assert_eq!(serde_json::to_string(&TransitionKind::Enter).unwrap(), "\"ENTER\"");
    }

    #[test]
    fn transition_events_get_distinct_ids() {
        let id = EntityId::new("rex").unwrap();
        let a = TransitionEvent::new(id.clone(), TransitionKind::Exit, Utc::now(), 120.0);
        let b = TransitionEvent::new(id, TransitionKind::Exit, Utc::now(), 120.0);
        assert_ne!(a.event_id, b.event_id);
        assert!(a.is_exit());
    }
}
