//! The monitoring service and its per-entity evaluation loops.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alerts::AlertScheduler;
use crate::config::MonitorConfig;
use crate::entity::EntityId;
use crate::error::{ExecutionError, FenceError, FenceResult, ValidationError};
use crate::evaluator::{ContainmentEvaluator, Evaluation};
use crate::events::{TransitionEvent, TransitionKind};
use crate::feed::{PositionFeed, SampleCallback};
use crate::geo::{Coordinate, SafeZone};
use crate::notify::NotificationSink;
use crate::position::PositionSample;
use crate::status::StatusPublisher;
use crate::storage::{
    bounded, AlarmStore, InMemoryStores, PositionStore, StatusStore, ZoneBackend,
};
use crate::tracker::{TrackerState, TransitionTracker};
use crate::zones::ZoneStore;

use super::stream::{EventHub, EventStream};

/// Builder for [`MonitorService`].
#[derive(Default)]
pub struct MonitorServiceBuilder {
    config: Option<MonitorConfig>,
    zone_backend: Option<Arc<dyn ZoneBackend>>,
    status_store: Option<Arc<dyn StatusStore>>,
    alarm_store: Option<Arc<dyn AlarmStore>>,
    position_store: Option<Arc<dyn PositionStore>>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl MonitorServiceBuilder {
    /// Sets the configuration (defaults otherwise).
    #[must_use]
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Remote zone store. Required.
    #[must_use]
    pub fn zone_backend(mut self, backend: Arc<dyn ZoneBackend>) -> Self {
        self.zone_backend = Some(backend);
        self
    }

    /// Shared status store. Required.
    #[must_use]
    pub fn status_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    /// Durable alarm flags. Required.
    #[must_use]
    pub fn alarm_store(mut self, store: Arc<dyn AlarmStore>) -> Self {
        self.alarm_store = Some(store);
        self
    }

    /// Shared last-known-position store, polled on every tick. Optional.
    #[must_use]
    pub fn position_store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.position_store = Some(store);
        self
    }

    /// Notification delivery. Required.
    #[must_use]
    pub fn notifier(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(sink);
        self
    }

    /// Wires every store from an in-memory bundle.
    #[must_use]
    pub fn in_memory(self, stores: &InMemoryStores) -> Self {
        self.zone_backend(Arc::clone(&stores.zones) as Arc<dyn ZoneBackend>)
            .status_store(Arc::clone(&stores.status) as Arc<dyn StatusStore>)
            .alarm_store(Arc::clone(&stores.alarms) as Arc<dyn AlarmStore>)
            .position_store(Arc::clone(&stores.positions) as Arc<dyn PositionStore>)
    }

    /// Validates the configuration and assembles the service.
    ///
    /// # Errors
    /// `MissingField` for any required collaborator, `InvalidConfig` for a bad config.
    pub fn build(self) -> FenceResult<MonitorService> {
        fn missing(field: &str) -> FenceError {
            ValidationError::MissingField {
                field: field.to_string(),
            }
            .into()
        }

        let config = self.config.unwrap_or_default().validate()?;
        let zone_backend = self.zone_backend.ok_or_else(|| missing("zone_backend"))?;
        let status_store = self.status_store.ok_or_else(|| missing("status_store"))?;
        let alarm_store = self.alarm_store.ok_or_else(|| missing("alarm_store"))?;
        let notifier = self.notifier.ok_or_else(|| missing("notifier"))?;

        let timeout = config.store_timeout();
        let zones = Arc::new(ZoneStore::new(zone_backend, config.zone_cache_ttl(), timeout));
        let feed = Arc::new(match self.position_store {
            Some(store) => PositionFeed::with_store(store, timeout),
            None => PositionFeed::new(timeout),
        }
        .with_max_clock_skew(config.max_clock_skew()));
        let evaluator = Arc::new(ContainmentEvaluator::new(Arc::clone(&zones), Arc::clone(&feed)));
        let alerts = AlertScheduler::new(
            Arc::clone(&alarm_store),
            notifier,
            Arc::clone(&evaluator),
            config.reminder_interval(),
            timeout,
        );
        let publisher = StatusPublisher::new(status_store, timeout, config.max_pending_events);
        let events = Arc::new(EventHub::new(config.event_stream_capacity));

        Ok(MonitorService {
            inner: Arc::new(ServiceInner {
                config,
                zones,
                feed,
                evaluator,
                alerts,
                publisher,
                alarm_store,
                events,
                trackers: DashMap::new(),
            }),
            loops: DashMap::new(),
        })
    }
}

impl std::fmt::Debug for MonitorServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorServiceBuilder")
            .field("config", &self.config)
            .field("zone_backend", &self.zone_backend.is_some())
            .field("status_store", &self.status_store.is_some())
            .field("alarm_store", &self.alarm_store.is_some())
            .field("position_store", &self.position_store.is_some())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

struct ServiceInner {
    config: MonitorConfig,
    zones: Arc<ZoneStore>,
    feed: Arc<PositionFeed>,
    evaluator: Arc<ContainmentEvaluator>,
    alerts: AlertScheduler,
    publisher: StatusPublisher,
    alarm_store: Arc<dyn AlarmStore>,
    events: Arc<EventHub>,
    trackers: DashMap<EntityId, TrackerState>,
}

impl ServiceInner {
    async fn evaluate_once(&self, entity_id: &EntityId, tracker: &mut TransitionTracker) {
        match self.evaluator.evaluate(entity_id).await {
            Evaluation::Evaluated(state) => {
                let event = tracker.observe(&state);
                match event.as_ref().map(|e| e.kind) {
                    Some(TransitionKind::Exit) => {
                        self.alerts.on_exit(entity_id, Some(state.distance_meters)).await;
                    }
                    Some(TransitionKind::Enter) => {
                        if let Err(e) = self.alerts.on_enter(entity_id).await {
                            warn!(entity_id = %entity_id, error = %e, "disarm incomplete; will retry");
                        }
                    }
                    None if tracker.state() == TrackerState::Outside => {
                        self.alerts.ensure_armed(entity_id).await;
                    }
                    None => {
                        if let Err(e) = self.alerts.retry_pending_clear(entity_id).await {
                            debug!(entity_id = %entity_id, error = %e, "alarm clear still pending");
                        }
                    }
                }

                self.publisher.publish(entity_id, &state, event.as_ref()).await;
                if let Some(event) = event {
                    self.announce(&event);
                }
            }
            Evaluation::Unfenced => {
                let previous = tracker.state();
                tracker.reset();
                if previous != TrackerState::Unknown {
                    info!(entity_id = %entity_id, "zone removed; entity is no longer fenced");
                    if let Err(e) = self.alerts.cancel(entity_id).await {
                        warn!(entity_id = %entity_id, error = %e, "disarm after zone removal incomplete");
                    }
                }
                self.publisher.publish_unfenced(entity_id).await;
            }
            Evaluation::AwaitingFix => {
                debug!(entity_id = %entity_id, "no position yet");
                self.publisher.retry_pending(entity_id).await;
            }
            Evaluation::Unavailable { reason } => {
                debug!(entity_id = %entity_id, reason = %reason, "zone unavailable; skipping evaluation");
                self.publisher.retry_pending(entity_id).await;
            }
        }
        self.trackers.insert(entity_id.clone(), tracker.state());
    }

    fn announce(&self, event: &TransitionEvent) {
        info!(
            entity_id = %event.entity_id,
            kind = %event.kind,
            distance_meters = event.distance_meters,
            "transition"
        );
        self.events.publish(event);
    }
}

async fn run_loop(
    inner: Arc<ServiceInner>,
    entity_id: EntityId,
    mut tracker: TransitionTracker,
    wake: Arc<Notify>,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut ticker = interval(inner.config.evaluation_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(entity_id = %entity_id, state = %tracker.state(), "evaluation loop started");

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.feed.refresh(&entity_id).await {
                    debug!(entity_id = %entity_id, error = %e, "position pull failed");
                }
            }
            () = wake.notified() => {}
        }
        inner.evaluate_once(&entity_id, &mut tracker).await;
    }

    debug!(entity_id = %entity_id, "evaluation loop stopped");
}

struct LoopHandle {
    cancel: oneshot::Sender<()>,
    wake: Arc<Notify>,
    join: JoinHandle<()>,
}

/// Top-level geofencing monitor.
///
/// ```rust,ignore
/// let stores = InMemoryStores::default();
/// let service = MonitorService::builder()
///     .in_memory(&stores)
///     .notifier(Arc::new(TracingSink))
///     .build()?;
///
/// let rex = EntityId::new("rex")?;
/// service.set_zone(&rex, Coordinate::new(0.0, 0.0), 100.0).await?;
/// service.start_monitoring(&rex).await?;
/// service.report_position(&rex, 0.0, 0.01, Utc::now())?;
/// ```
pub struct MonitorService {
    inner: Arc<ServiceInner>,
    loops: DashMap<EntityId, LoopHandle>,
}

impl MonitorService {
    /// Starts building a service.
    #[must_use]
    pub fn builder() -> MonitorServiceBuilder {
        MonitorServiceBuilder::default()
    }

    /// Starts the evaluation loop for an entity.
    ///
    /// If a persisted armed flag survived a restart, the tracker starts out
    /// `OUTSIDE` and reminders resume without a duplicate immediate alert.
    ///
    /// # Errors
    /// `AlreadyMonitored` if a loop is already running for the entity.
    pub async fn start_monitoring(&self, entity_id: &EntityId) -> FenceResult<()> {
        if self.loops.contains_key(entity_id) {
            return Err(already_monitored(entity_id));
        }

        let timeout = self.inner.config.store_timeout();
        let armed = match bounded(timeout, "alarm read", self.inner.alarm_store.is_armed(entity_id)).await {
            Ok(armed) => armed,
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "alarm flag unreadable; starting from UNKNOWN");
                false
            }
        };
        let initial = if armed {
            TrackerState::Outside
        } else {
            TrackerState::Unknown
        };

        let wake = Arc::new(Notify::new());
        match self.loops.entry(entity_id.clone()) {
            Entry::Occupied(_) => return Err(already_monitored(entity_id)),
            Entry::Vacant(slot) => {
                let (cancel, cancel_rx) = oneshot::channel();
                let join = tokio::spawn(run_loop(
                    Arc::clone(&self.inner),
                    entity_id.clone(),
                    TransitionTracker::with_state(entity_id.clone(), initial),
                    Arc::clone(&wake),
                    cancel_rx,
                ));
                slot.insert(LoopHandle {
                    cancel,
                    wake: Arc::clone(&wake),
                    join,
                });
            }
        }
        self.inner.trackers.insert(entity_id.clone(), initial);

        if armed {
            if let Err(e) = self.inner.alerts.resume(entity_id).await {
                warn!(entity_id = %entity_id, error = %e, "could not resume reminders");
            }
        }

        let on_sample: SampleCallback = Arc::new(move |_: &PositionSample| wake.notify_one());
        self.inner.feed.subscribe(entity_id, on_sample);

        info!(entity_id = %entity_id, resumed = armed, "monitoring started");
        Ok(())
    }

    /// Stops the entity's loop and disarms its alerts.
    ///
    /// The loop is always stopped; a disarm that could not be persisted is
    /// logged and returned.
    ///
    /// # Errors
    /// `NotMonitored` if no loop is running, or the disarm failure.
    pub async fn stop_monitoring(&self, entity_id: &EntityId) -> FenceResult<()> {
        let Some((_, handle)) = self.loops.remove(entity_id) else {
            return Err(FenceError::Execution(ExecutionError::NotMonitored {
                entity_id: entity_id.clone(),
            }));
        };

        self.inner.feed.unsubscribe(entity_id);
        self.join_loop(entity_id, handle).await;
        self.inner.trackers.remove(entity_id);
        self.inner.evaluator.invalidate(entity_id);
        self.inner.zones.release(entity_id);
        self.inner.publisher.forget(entity_id);

        match self.inner.alerts.cancel(entity_id).await {
            Ok(()) => {
                self.inner.alerts.forget(entity_id);
                info!(entity_id = %entity_id, "monitoring stopped");
                Ok(())
            }
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "monitoring stopped but alarm flag not cleared");
                Err(e)
            }
        }
    }

    async fn join_loop(&self, entity_id: &EntityId, handle: LoopHandle) {
        let LoopHandle { cancel, mut join, .. } = handle;
        let _ = cancel.send(());
        // An in-flight evaluation finishes within a few store timeouts.
        let grace = self.inner.config.store_timeout() * 4;
        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                warn!(entity_id = %entity_id, "evaluation loop panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(entity_id = %entity_id, "evaluation loop did not stop in time; aborting");
                join.abort();
            }
        }
    }

    /// Stops every loop and reminder without clearing persisted alarm flags.
    ///
    /// Use on process shutdown; a later [`MonitorService::resume_alarms`] or
    /// [`MonitorService::start_monitoring`] picks the alarms back up.
    pub async fn shutdown(&self) {
        let ids = self.monitored_entities();
        for entity_id in ids {
            if let Some((_, handle)) = self.loops.remove(&entity_id) {
                self.inner.feed.unsubscribe(&entity_id);
                self.join_loop(&entity_id, handle).await;
            }
        }
        self.inner.alerts.suspend_all().await;
        info!("monitor shut down");
    }

    /// Restarts reminders for every persisted armed flag.
    ///
    /// # Errors
    /// The storage error if the flags could not be listed.
    pub async fn resume_alarms(&self) -> FenceResult<Vec<EntityId>> {
        self.inner.alerts.resume_armed().await
    }

    /// Owner acknowledgment: stops reminders for the current outside episode.
    ///
    /// Monitoring continues; the next EXIT alerts again.
    ///
    /// # Errors
    /// The storage error if the flag could not be cleared.
    pub async fn disarm(&self, entity_id: &EntityId) -> FenceResult<()> {
        self.inner.alerts.cancel(entity_id).await
    }

    /// Pushes a position sample from the entity's device.
    ///
    /// # Errors
    /// Malformed coordinates.
    pub fn report_position(
        &self,
        entity_id: &EntityId,
        lat: f64,
        lng: f64,
        captured_at: DateTime<Utc>,
    ) -> FenceResult<bool> {
        let sample = PositionSample::new(entity_id.clone(), lat, lng, captured_at)?;
        self.inner.feed.report_position(sample)
    }

    /// Replaces the entity's zone; the next evaluation uses it.
    ///
    /// # Errors
    /// Validation errors, or the remote write failure (the edit still
    /// applies locally).
    pub async fn set_zone(
        &self,
        entity_id: &EntityId,
        center: Coordinate,
        radius_meters: f64,
    ) -> FenceResult<()> {
        let zone = SafeZone::new(entity_id.clone(), center, radius_meters)?;
        let result = self.inner.zones.set_zone(zone).await;
        self.inner.evaluator.invalidate(entity_id);
        self.wake(entity_id);
        result
    }

    /// Drops the cached zone so the next evaluation refetches it.
    pub fn refresh_zone(&self, entity_id: &EntityId) {
        self.inner.zones.invalidate(entity_id);
        self.inner.evaluator.invalidate(entity_id);
        self.wake(entity_id);
    }

    /// Current zone for the entity.
    ///
    /// # Errors
    /// `ZoneUnavailable` if the back-end is unreachable and nothing is cached.
    pub async fn zone(&self, entity_id: &EntityId) -> FenceResult<Option<SafeZone>> {
        Ok(self.inner.zones.get_zone(entity_id).await?.zone)
    }

    fn wake(&self, entity_id: &EntityId) {
        if let Some(handle) = self.loops.get(entity_id) {
            handle.wake.notify_one();
        }
    }

    /// Subscribes to confirmed transitions of every monitored entity.
    #[must_use]
    pub fn subscribe_events(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Events lost because a subscriber's buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.inner.events.dropped()
    }

    /// Whether an evaluation loop is running for the entity.
    #[must_use]
    pub fn is_monitoring(&self, entity_id: &EntityId) -> bool {
        self.loops.contains_key(entity_id)
    }

    /// Entities with a running loop, sorted.
    #[must_use]
    pub fn monitored_entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self.loops.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Tracker state after the entity's latest evaluation.
    #[must_use]
    pub fn tracker_state(&self, entity_id: &EntityId) -> Option<TrackerState> {
        self.inner.trackers.get(entity_id).map(|s| *s)
    }

    /// Whether reminders are currently running for the entity.
    pub async fn is_alarm_active(&self, entity_id: &EntityId) -> bool {
        self.inner.alerts.is_armed(entity_id).await
    }

    /// The validated configuration the service was built with.
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for MonitorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorService")
            .field("config", &self.inner.config)
            .field("monitored", &self.loops.len())
            .finish_non_exhaustive()
    }
}

impl Drop for MonitorService {
    fn drop(&mut self) {
        for entry in &self.loops {
            entry.value().join.abort();
        }
    }
}

fn already_monitored(entity_id: &EntityId) -> FenceError {
    FenceError::Execution(ExecutionError::AlreadyMonitored {
        entity_id: entity_id.clone(),
    })
}
