//! Containment evaluation.
//!
//! Combines the active zone from [`ZoneStore`] with the latest sample from
//! [`PositionFeed`]. Results are memoized per entity on the pair
//! (zone revision, sample capture time), so a zone edit or a newer sample
//! always forces a recomputation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::entity::EntityId;
use crate::feed::PositionFeed;
use crate::zones::ZoneStore;

/// Derived containment for one entity at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainmentState {
    /// Whether the latest sample lies inside the zone (boundary inclusive).
    pub inside: bool,
    /// Distance from the zone center, in meters.
    pub distance_meters: f64,
    /// Radius of the zone the sample was checked against.
    pub radius_meters: f64,
    /// Capture time of the sample used.
    pub last_sample_at: DateTime<Utc>,
    /// True when the zone could not be confirmed against the back-end.
    pub zone_stale: bool,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// No zone configured; the entity is not fenced and must never alert.
    Unfenced,
    /// A zone exists but no position has been received yet.
    AwaitingFix,
    /// The zone could not be read and nothing is cached.
    Unavailable {
        /// Why the zone read failed.
        reason: String,
    },
    /// Containment was computed.
    Evaluated(ContainmentState),
}

impl Evaluation {
    /// The computed state, if any.
    #[must_use]
    pub const fn state(&self) -> Option<&ContainmentState> {
        match self {
            Self::Evaluated(state) => Some(state),
            _ => None,
        }
    }

    /// Returns true if the entity was positively found inside its zone.
    #[must_use]
    pub fn is_inside(&self) -> bool {
        self.state().is_some_and(|s| s.inside)
    }
}

#[derive(Debug, Clone, Copy)]
struct Memo {
    revision: u64,
    sample_at: DateTime<Utc>,
    state: ContainmentState,
}

/// Side-effect free containment evaluator.
#[derive(Debug)]
pub struct ContainmentEvaluator {
    zones: Arc<ZoneStore>,
    feed: Arc<PositionFeed>,
    memo: DashMap<EntityId, Memo>,
    computations: AtomicU64,
}

impl ContainmentEvaluator {
    /// Creates an evaluator over the shared zone cache and position feed.
    ///
    /// Both are read on every evaluation; the evaluator owns only its memo.
    #[must_use]
    pub fn new(zones: Arc<ZoneStore>, feed: Arc<PositionFeed>) -> Self {
        Self {
            zones,
            feed,
            memo: DashMap::new(),
            computations: AtomicU64::new(0),
        }
    }

    /// Evaluates the entity against its most recent zone and sample.
    pub async fn evaluate(&self, entity_id: &EntityId) -> Evaluation {
        let lookup = match self.zones.get_zone(entity_id).await {
            Ok(lookup) => lookup,
            Err(e) => {
                return Evaluation::Unavailable {
                    reason: e.to_string(),
                }
            }
        };
        let Some(zone) = lookup.zone else {
            self.memo.remove(entity_id);
            return Evaluation::Unfenced;
        };
        let Some(sample) = self.feed.latest(entity_id) else {
            return Evaluation::AwaitingFix;
        };

        if let Some(memo) = self.memo.get(entity_id) {
            if memo.revision == lookup.revision && memo.sample_at == sample.captured_at {
                let mut state = memo.state;
                state.zone_stale = lookup.stale;
                return Evaluation::Evaluated(state);
            }
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        let distance_meters = zone.distance_to(sample.coordinate);
        let state = ContainmentState {
            inside: distance_meters <= zone.radius_meters,
            distance_meters,
            radius_meters: zone.radius_meters,
            last_sample_at: sample.captured_at,
            zone_stale: lookup.stale,
        };
        trace!(
            entity_id = %entity_id,
            inside = state.inside,
            distance_meters,
            revision = lookup.revision,
            "containment computed"
        );
        self.memo.insert(
            entity_id.clone(),
            Memo {
                revision: lookup.revision,
                sample_at: sample.captured_at,
                state,
            },
        );
        Evaluation::Evaluated(state)
    }

    /// Drops the memoized result for the entity.
    pub fn invalidate(&self, entity_id: &EntityId) {
        self.memo.remove(entity_id);
    }

    /// Number of evaluations that were actually computed (memo misses).
    #[must_use]
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    /// Zone store the evaluator reads from.
    #[must_use]
    pub fn zones(&self) -> &Arc<ZoneStore> {
        &self.zones
    }

    /// Position feed the evaluator reads from.
    #[must_use]
    pub fn feed(&self) -> &Arc<PositionFeed> {
        &self.feed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use crate::geo::{Coordinate, SafeZone};
    use crate::position::PositionSample;
    use crate::storage::{InMemoryZoneBackend, ZoneBackend};

    fn rex() -> EntityId {
        EntityId::new("rex").unwrap()
    }

    fn setup() -> (Arc<InMemoryZoneBackend>, ContainmentEvaluator) {
        let backend = Arc::new(InMemoryZoneBackend::new());
        let zones = Arc::new(ZoneStore::new(
            Arc::clone(&backend) as Arc<dyn ZoneBackend>,
            Duration::from_secs(60),
            Duration::from_secs(2),
        ));
        let feed = Arc::new(PositionFeed::new(Duration::from_secs(2)));
        (backend, ContainmentEvaluator::new(zones, feed))
    }

    #[tokio::test]
    async fn unfenced_entity_is_not_inside_or_outside() {
        let (_backend, eval) = setup();
        eval.feed()
            .report_position(PositionSample::now(rex(), 0.0, 0.0).unwrap())
            .unwrap();
        assert_eq!(eval.evaluate(&rex()).await, Evaluation::Unfenced);
        assert!(!eval.evaluate(&rex()).await.is_inside());
    }

    #[tokio::test]
    async fn zone_without_sample_awaits_fix() {
        let (backend, eval) = setup();
        backend
            .insert(SafeZone::new(rex(), Coordinate::new(0.0, 0.0), 100.0).unwrap())
            .unwrap();
        assert_eq!(eval.evaluate(&rex()).await, Evaluation::AwaitingFix);
    }

    #[tokio::test]
    async fn unreachable_zone_with_empty_cache_is_unavailable() {
        let (backend, eval) = setup();
        backend.set_offline(true);
        assert!(matches!(
            eval.evaluate(&rex()).await,
            Evaluation::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn inside_and_outside_against_hundred_meter_zone() {
        let (backend, eval) = setup();
        backend
            .insert(SafeZone::new(rex(), Coordinate::new(0.0, 0.0), 100.0).unwrap())
            .unwrap();
        let t0 = Utc::now();
        eval.feed()
            .report_position(PositionSample::new(rex(), 0.0, 0.0, t0).unwrap())
            .unwrap();
        let state = *eval.evaluate(&rex()).await.state().unwrap();
        assert!(state.inside);
        assert_eq!(state.distance_meters, 0.0);
        assert_eq!(state.radius_meters, 100.0);

        eval.feed()
            .report_position(
                PositionSample::new(rex(), 0.0, 0.01, t0 + ChronoDuration::seconds(1)).unwrap(),
            )
            .unwrap();
        let state = *eval.evaluate(&rex()).await.state().unwrap();
        assert!(!state.inside);
        assert!(state.distance_meters > 1_000.0);
    }

    #[tokio::test]
    async fn memo_reused_until_zone_or_sample_changes() {
        let (backend, eval) = setup();
        backend
            .insert(SafeZone::new(rex(), Coordinate::new(0.0, 0.0), 100.0).unwrap())
            .unwrap();
        eval.feed()
            .report_position(PositionSample::now(rex(), 0.0, 0.005).unwrap())
            .unwrap();

        assert!(!eval.evaluate(&rex()).await.is_inside());
        assert!(!eval.evaluate(&rex()).await.is_inside());
        assert_eq!(eval.computations(), 1);

        eval.zones()
            .set_zone(SafeZone::new(rex(), Coordinate::new(0.0, 0.0), 1_000.0).unwrap())
            .await
            .unwrap();
        assert!(eval.evaluate(&rex()).await.is_inside());
        assert_eq!(eval.computations(), 2);

        eval.invalidate(&rex());
        assert!(eval.evaluate(&rex()).await.is_inside());
        assert_eq!(eval.computations(), 3);
    }
}
