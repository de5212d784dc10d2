//! Status publishing to the shared status store.
//!
//! Writes are best-effort: every call is bounded by a timeout, failures are
//! logged and whatever did not make it is retried on the next cycle. Events
//! are appended in order before the status record that reflects them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::entity::EntityId;
use crate::evaluator::ContainmentState;
use crate::events::TransitionEvent;
use crate::storage::{bounded, StatusStore};

/// Containment as shown to dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZoneStatus {
    /// Inside the safe zone.
    In,
    /// Outside the safe zone.
    Out,
    /// No zone configured.
    Unknown,
}

impl fmt::Display for ZoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("IN"),
            Self::Out => f.write_str("OUT"),
            Self::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Record stored per entity in the shared status store.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub entity_id: EntityId,
    pub status: ZoneStatus,
    /// Time of the most recent EXIT, kept across restarts.
    pub last_exit: Option<DateTime<Utc>>,
    pub distance_meters: Option<f64>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    fn same_content(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
            && self.status == other.status
            && self.last_exit == other.last_exit
            && self.distance_meters == other.distance_meters
            && self.last_sample_at == other.last_sample_at
    }
}

#[derive(Debug, Default)]
struct PublishState {
    /// Last record the store acknowledged.
    last_written: Option<StatusRecord>,
    /// Record that still has to be written.
    unsynced: Option<StatusRecord>,
    pending_events: VecDeque<TransitionEvent>,
    last_exit: Option<DateTime<Utc>>,
    seeded: bool,
}

/// Mirrors containment status and transitions into a [`StatusStore`].
pub struct StatusPublisher {
    store: Arc<dyn StatusStore>,
    timeout: Duration,
    max_pending_events: usize,
    states: DashMap<EntityId, Arc<Mutex<PublishState>>>,
}

impl StatusPublisher {
    /// Creates a publisher writing through `store`.
    ///
    /// Every store call is bounded by `timeout`; at most
    /// `max_pending_events` transitions are queued per entity while the
    /// store is unreachable, oldest dropped first.
    #[must_use]
    pub fn new(store: Arc<dyn StatusStore>, timeout: Duration, max_pending_events: usize) -> Self {
        Self {
            store,
            timeout,
            max_pending_events: max_pending_events.max(1),
            states: DashMap::new(),
        }
    }

    fn state(&self, entity_id: &EntityId) -> Arc<Mutex<PublishState>> {
        Arc::clone(
            self.states
                .entry(entity_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(PublishState::default())))
                .value(),
        )
    }

    /// Publishes an evaluated containment and, if any, the transition it caused.
    ///
    /// Returns true when the store is fully up to date for the entity.
    pub async fn publish(
        &self,
        entity_id: &EntityId,
        containment: &ContainmentState,
        event: Option<&TransitionEvent>,
    ) -> bool {
        let state = self.state(entity_id);
        let mut state = state.lock().await;

        if let Some(event) = event {
            if state.pending_events.len() >= self.max_pending_events {
                if let Some(dropped) = state.pending_events.pop_front() {
                    warn!(entity_id = %entity_id, event_id = %dropped.event_id, "event queue full; dropping oldest unsent event");
                }
            }
            if event.is_exit() {
                state.last_exit = Some(event.occurred_at);
            }
            state.pending_events.push_back(event.clone());
        }

        let status = if containment.inside {
            ZoneStatus::In
        } else {
            ZoneStatus::Out
        };
        state.unsynced = Some(StatusRecord {
            entity_id: entity_id.clone(),
            status,
            last_exit: state.last_exit,
            distance_meters: Some(containment.distance_meters),
            last_sample_at: Some(containment.last_sample_at),
            updated_at: Utc::now(),
        });

        self.sync(entity_id, &mut state).await
    }

    /// Publishes `UNKNOWN` for an entity with no zone.
    pub async fn publish_unfenced(&self, entity_id: &EntityId) -> bool {
        let state = self.state(entity_id);
        let mut state = state.lock().await;
        state.unsynced = Some(StatusRecord {
            entity_id: entity_id.clone(),
            status: ZoneStatus::Unknown,
            last_exit: state.last_exit,
            distance_meters: None,
            last_sample_at: None,
            updated_at: Utc::now(),
        });
        self.sync(entity_id, &mut state).await
    }

    /// Retries whatever the last cycle failed to write.
    pub async fn retry_pending(&self, entity_id: &EntityId) -> bool {
        let Some(state) = self.states.get(entity_id).map(|s| Arc::clone(s.value())) else {
            return true;
        };
        let mut state = state.lock().await;
        self.sync(entity_id, &mut state).await
    }

    /// Returns true if events or a record are waiting to be written.
    pub async fn has_pending(&self, entity_id: &EntityId) -> bool {
        let Some(state) = self.states.get(entity_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let state = state.lock().await;
        !state.pending_events.is_empty() || state.unsynced.is_some()
    }

    /// Drops local state for an entity whose monitoring stopped.
    ///
    /// State with unwritten events or records is kept so a later monitor
    /// can still flush it. Returns true if the state was dropped.
    pub fn forget(&self, entity_id: &EntityId) -> bool {
        self.states
            .remove_if(entity_id, |_, state| {
                state
                    .try_lock()
                    .is_ok_and(|s| s.pending_events.is_empty() && s.unsynced.is_none())
            })
            .is_some()
    }

    #[cfg(test)]
    pub(crate) fn tracked_entities(&self) -> usize {
        self.states.len()
    }

    async fn seed(&self, entity_id: &EntityId, state: &mut PublishState) -> bool {
        if state.seeded {
            return true;
        }
        match bounded(self.timeout, "status read", self.store.get_status(entity_id)).await {
            Ok(existing) => {
                let stored_exit = existing.and_then(|r| r.last_exit);
                // A local EXIT recorded before seeding is newer than anything stored.
                state.last_exit = state.last_exit.or(stored_exit);
                if let Some(record) = state.unsynced.as_mut() {
                    record.last_exit = state.last_exit;
                }
                state.seeded = true;
                true
            }
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "status read failed; will retry");
                false
            }
        }
    }

    async fn sync(&self, entity_id: &EntityId, state: &mut PublishState) -> bool {
        if !self.seed(entity_id, state).await {
            return false;
        }

        while let Some(event) = state.pending_events.front() {
            match bounded(self.timeout, "event append", self.store.append_event(event)).await {
                Ok(()) => {
                    debug!(entity_id = %entity_id, kind = %event.kind, "transition appended");
                    state.pending_events.pop_front();
                }
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, pending = state.pending_events.len(), "event append failed; will retry");
                    return false;
                }
            }
        }

        let Some(record) = state.unsynced.take() else {
            return true;
        };
        if state
            .last_written
            .as_ref()
            .is_some_and(|written| written.same_content(&record))
        {
            return true;
        }

        match bounded(self.timeout, "status write", self.store.put_status(&record)).await {
            Ok(()) => {
                debug!(entity_id = %entity_id, status = %record.status, "status published");
                state.last_written = Some(record);
                true
            }
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "status write failed; will retry");
                state.unsynced = Some(record);
                false
            }
        }
    }
}

impl fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("timeout", &self.timeout)
            .field("max_pending_events", &self.max_pending_events)
            .field("entities", &self.states.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TransitionKind;
    use crate::storage::InMemoryStatusStore;

    fn rex() -> EntityId {
        EntityId::new("rex").unwrap()
    }

    fn containment(inside: bool, distance: f64) -> ContainmentState {
        ContainmentState {
            inside,
            distance_meters: distance,
            radius_meters: 100.0,
            last_sample_at: Utc::now(),
            zone_stale: false,
        }
    }

    fn publisher(store: &Arc<InMemoryStatusStore>, max_pending: usize) -> StatusPublisher {
        StatusPublisher::new(
            Arc::clone(store) as Arc<dyn StatusStore>,
            Duration::from_secs(2),
            max_pending,
        )
    }

    #[tokio::test]
    async fn exit_is_published_with_last_exit() {
        let store = Arc::new(InMemoryStatusStore::new());
        let publisher = publisher(&store, 8);
        let state = containment(false, 1_112.0);
        let exit = TransitionEvent::new(rex(), TransitionKind::Exit, state.last_sample_at, 1_112.0);

        assert!(publisher.publish(&rex(), &state, Some(&exit)).await);
        let record = store.record(&rex()).unwrap();
        assert_eq!(record.status, ZoneStatus::Out);
        assert_eq!(record.last_exit, Some(exit.occurred_at));
        assert_eq!(store.events(&rex()), vec![exit]);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_rewritten() {
        let store = Arc::new(InMemoryStatusStore::new());
        let publisher = publisher(&store, 8);
        let state = containment(true, 5.0);
        publisher.publish(&rex(), &state, None).await;
        publisher.publish(&rex(), &state, None).await;
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn unfenced_is_unknown_and_keeps_last_exit() {
        let store = Arc::new(InMemoryStatusStore::new());
        let publisher = publisher(&store, 8);
        let state = containment(false, 300.0);
        let exit = TransitionEvent::new(rex(), TransitionKind::Exit, state.last_sample_at, 300.0);
        publisher.publish(&rex(), &state, Some(&exit)).await;

        assert!(publisher.publish_unfenced(&rex()).await);
        let record = store.record(&rex()).unwrap();
        assert_eq!(record.status, ZoneStatus::Unknown);
        assert_eq!(record.last_exit, Some(exit.occurred_at));
        assert!(record.distance_meters.is_none());
    }

    #[tokio::test]
    async fn failed_writes_are_retried_in_order() {
        let store = Arc::new(InMemoryStatusStore::new());
        let publisher = publisher(&store, 8);
        publisher.publish(&rex(), &containment(true, 5.0), None).await;

        store.set_offline(true);
        let out = containment(false, 400.0);
        let exit = TransitionEvent::new(rex(), TransitionKind::Exit, out.last_sample_at, 400.0);
        assert!(!publisher.publish(&rex(), &out, Some(&exit)).await);
        let back = containment(true, 3.0);
        let enter = TransitionEvent::new(rex(), TransitionKind::Enter, back.last_sample_at, 3.0);
        assert!(!publisher.publish(&rex(), &back, Some(&enter)).await);
        assert!(publisher.has_pending(&rex()).await);

        store.set_offline(false);
        assert!(publisher.retry_pending(&rex()).await);
        let kinds: Vec<_> = store.events(&rex()).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![TransitionKind::Exit, TransitionKind::Enter]);
        let record = store.record(&rex()).unwrap();
        assert_eq!(record.status, ZoneStatus::In);
        assert_eq!(record.last_exit, Some(exit.occurred_at));
        assert!(!publisher.has_pending(&rex()).await);
    }

    #[tokio::test]
    async fn pending_queue_drops_oldest_when_full() {
        let store = Arc::new(InMemoryStatusStore::new());
        let publisher = publisher(&store, 2);
        publisher.publish(&rex(), &containment(true, 1.0), None).await;
        store.set_offline(true);

        let mut sent = Vec::new();
        for i in 0..3 {
            let kind = if i % 2 == 0 {
                TransitionKind::Exit
            } else {
                TransitionKind::Enter
            };
            let ev = TransitionEvent::new(rex(), kind, Utc::now(), 10.0);
            publisher
                .publish(&rex(), &containment(kind == TransitionKind::Enter, 10.0), Some(&ev))
                .await;
            sent.push(ev);
        }

        store.set_offline(false);
        assert!(publisher.retry_pending(&rex()).await);
        assert_eq!(store.events(&rex()), sent[1..].to_vec());
    }

    #[tokio::test]
    async fn last_exit_is_seeded_from_store() {
        let store = Arc::new(InMemoryStatusStore::new());
        let earlier = Utc::now() - chrono::Duration::hours(1);
        store
            .put_status(&StatusRecord {
                entity_id: rex(),
                status: ZoneStatus::Out,
                last_exit: Some(earlier),
                distance_meters: Some(200.0),
                last_sample_at: None,
                updated_at: earlier,
            })
            .await
            .unwrap();

        let publisher = publisher(&store, 8);
        publisher.publish(&rex(), &containment(true, 2.0), None).await;
        let record = store.record(&rex()).unwrap();
        assert_eq!(record.status, ZoneStatus::In);
        assert_eq!(record.last_exit, Some(earlier));
    }
}
