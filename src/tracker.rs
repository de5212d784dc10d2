//! Per-entity transition state machine.
//!
//! ```text
//! UNKNOWN --inside-->  INSIDE            (no event)
//! UNKNOWN --outside--> OUTSIDE  EXIT
//! INSIDE  --outside--> OUTSIDE  EXIT
//! OUTSIDE --inside-->  INSIDE   ENTER
//! ```
//!
//! Self-loops emit nothing, so repeated identical evaluations never produce
//! duplicate events.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::evaluator::ContainmentState;
use crate::events::{TransitionEvent, TransitionKind};

/// Tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackerState {
    /// Nothing observed yet.
    #[default]
    Unknown,
    /// Last confirmed inside.
    Inside,
    /// Last confirmed outside.
    Outside,
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("UNKNOWN"),
            Self::Inside => f.write_str("INSIDE"),
            Self::Outside => f.write_str("OUTSIDE"),
        }
    }
}

/// Debounces containment results into ENTER/EXIT events for one entity.
#[derive(Debug, Clone)]
pub struct TransitionTracker {
    entity_id: EntityId,
    state: TrackerState,
}

impl TransitionTracker {
    /// Starts in `Unknown`.
    #[must_use]
    pub fn new(entity_id: EntityId) -> Self {
        Self::with_state(entity_id, TrackerState::Unknown)
    }

    /// Starts in a given state, e.g. `Outside` when an armed alarm survived a restart.
    #[must_use]
    pub const fn with_state(entity_id: EntityId, state: TrackerState) -> Self {
        Self { entity_id, state }
    }

    /// Feeds one evaluation; returns the event if the state flipped.
    pub fn observe(&mut self, containment: &ContainmentState) -> Option<TransitionEvent> {
        let (next, kind) = match (self.state, containment.inside) {
            (TrackerState::Unknown, true) => (TrackerState::Inside, None),
            (TrackerState::Unknown | TrackerState::Inside, false) => {
                (TrackerState::Outside, Some(TransitionKind::Exit))
            }
            (TrackerState::Outside, true) => (TrackerState::Inside, Some(TransitionKind::Enter)),
            (TrackerState::Inside, true) => (TrackerState::Inside, None),
            (TrackerState::Outside, false) => (TrackerState::Outside, None),
        };
        self.state = next;
        kind.map(|kind| {
            TransitionEvent::new(
                self.entity_id.clone(),
                kind,
                containment.last_sample_at,
                containment.distance_meters,
            )
        })
    }

    /// Back to `Unknown` (zone removed).
    pub fn reset(&mut self) {
        self.state = TrackerState::Unknown;
    }

    /// Last known side of the boundary; `Unknown` until the first observation.
    #[must_use]
    pub const fn state(&self) -> TrackerState {
        self.state
    }

    /// Entity this tracker follows.
    #[must_use]
    pub const fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn containment(inside: bool) -> ContainmentState {
        ContainmentState {
            inside,
            distance_meters: if inside { 10.0 } else { 500.0 },
            radius_meters: 100.0,
            last_sample_at: Utc::now(),
            zone_stale: false,
        }
    }

    fn tracker() -> TransitionTracker {
        TransitionTracker::new(EntityId::new("rex").unwrap())
    }

    #[test]
    fn first_inside_is_silent() {
        let mut t = tracker();
        assert!(t.observe(&containment(true)).is_none());
        assert_eq!(t.state(), TrackerState::Inside);
    }

    #[test]
    fn first_outside_emits_exit() {
        let mut t = tracker();
        let ev = t.observe(&containment(false)).unwrap();
        assert_eq!(ev.kind, TransitionKind::Exit);
        assert_eq!(ev.distance_meters, 500.0);
        assert_eq!(t.state(), TrackerState::Outside);
    }

    #[test]
    fn flips_emit_and_self_loops_do_not() {
        let mut t = tracker();
        let kinds: Vec<_> = [true, true, false, false, true, true, false]
            .into_iter()
            .filter_map(|inside| t.observe(&containment(inside)).map(|e| e.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![TransitionKind::Exit, TransitionKind::Enter, TransitionKind::Exit]
        );
    }

    #[test]
    fn seeded_outside_does_not_repeat_exit() {
        let mut t = TransitionTracker::with_state(EntityId::new("rex").unwrap(), TrackerState::Outside);
        assert!(t.observe(&containment(false)).is_none());
        assert_eq!(t.observe(&containment(true)).unwrap().kind, TransitionKind::Enter);
    }

    #[test]
    fn reset_returns_to_unknown() {
        let mut t = tracker();
        t.observe(&containment(false));
        t.reset();
        assert_eq!(t.state(), TrackerState::Unknown);
        assert!(t.observe(&containment(true)).is_none());
    }
}
