//! Exit alerts and repeating reminders.
//!
//! The durable alarm flag is the source of truth across restarts: it is
//! written before the first alert goes out and cleared only once the
//! reminder timer has been stopped. When the flag store misbehaves the
//! scheduler errs on the side of reminding again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::entity::EntityId;
use crate::error::{ExecutionError, FenceError, FenceResult};
use crate::evaluator::{ContainmentEvaluator, Evaluation};
use crate::notify::{Alert, AlertKind, NotificationSink};
use crate::storage::{bounded, AlarmStore};

/// Persisted alarm flag for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmState {
    /// Entity the flag belongs to.
    pub entity_id: EntityId,
    /// True while reminders must keep firing.
    pub armed: bool,
}

impl AlarmState {
    /// An armed flag.
    #[must_use]
    pub const fn armed(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            armed: true,
        }
    }

    /// A cleared flag.
    #[must_use]
    pub const fn disarmed(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            armed: false,
        }
    }
}

#[derive(Debug, Default)]
struct AlarmSlot {
    reminder: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is replaced or stopped.
    generation: u64,
    /// A flag clear failed and must be retried.
    pending_clear: bool,
    /// Reminders were stopped by the owner or another device for this episode.
    acknowledged: bool,
}

impl AlarmSlot {
    fn stop_timer(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        match self.reminder.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn is_running(&self) -> bool {
        self.reminder.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct SchedulerInner {
    alarms: Arc<dyn AlarmStore>,
    sink: Arc<dyn NotificationSink>,
    evaluator: Arc<ContainmentEvaluator>,
    reminder_interval: Duration,
    timeout: Duration,
    slots: DashMap<EntityId, Arc<Mutex<AlarmSlot>>>,
}

enum Tick {
    Continue,
    /// Entity back inside or unfenced.
    Disarm,
    /// Flag cleared by someone else.
    Acknowledged,
}

impl SchedulerInner {
    fn slot(&self, entity_id: &EntityId) -> Arc<Mutex<AlarmSlot>> {
        Arc::clone(
            self.slots
                .entry(entity_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(AlarmSlot::default())))
                .value(),
        )
    }

    async fn persist(&self, state: AlarmState) -> FenceResult<()> {
        bounded(self.timeout, "alarm write", self.alarms.put_alarm(&state)).await
    }

    async fn send(&self, alert: Alert) -> FenceResult<()> {
        match timeout(self.timeout, self.sink.send_alert(&alert)).await {
            Ok(Ok(())) => {
                debug!(entity_id = %alert.entity_id, kind = ?alert.kind, "alert delivered");
                Ok(())
            }
            Ok(Err(e)) => Err(FenceError::Execution(ExecutionError::Notification {
                message: e.to_string(),
            })),
            Err(_) => Err(FenceError::timeout("alert dispatch", self.timeout)),
        }
    }

    async fn reminder_tick(&self, entity_id: &EntityId, persisted: &mut bool) -> Tick {
        if *persisted {
            match bounded(self.timeout, "alarm read", self.alarms.is_armed(entity_id)).await {
                Ok(false) => {
                    info!(entity_id = %entity_id, "alarm flag cleared elsewhere; stopping reminders");
                    return Tick::Acknowledged;
                }
                Ok(true) => {}
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "alarm flag unreadable; assuming armed");
                }
            }
        } else {
            match self.persist(AlarmState::armed(entity_id.clone())).await {
                Ok(()) => *persisted = true,
                Err(e) => warn!(entity_id = %entity_id, error = %e, "alarm flag still not persisted"),
            }
        }

        let distance = match self.evaluator.evaluate(entity_id).await {
            Evaluation::Evaluated(state) if state.inside => {
                debug!(entity_id = %entity_id, "entity back inside at reminder tick");
                return Tick::Disarm;
            }
            Evaluation::Unfenced => {
                debug!(entity_id = %entity_id, "zone removed; stopping reminders");
                return Tick::Disarm;
            }
            Evaluation::Evaluated(state) => Some(state.distance_meters),
            Evaluation::AwaitingFix | Evaluation::Unavailable { .. } => None,
        };

        if let Err(e) = self
            .send(Alert::new(entity_id.clone(), AlertKind::Reminder, distance))
            .await
        {
            warn!(entity_id = %entity_id, error = %e, "reminder not delivered; will retry next tick");
        }
        Tick::Continue
    }

    async fn finish_reminder(&self, entity_id: &EntityId, generation: u64, tick: Tick) {
        // Held across the flag write so a concurrent re-arm cannot be overwritten.
        let slot = self.slot(entity_id);
        let mut slot = slot.lock().await;
        if slot.generation != generation {
            return;
        }
        slot.reminder = None;
        if matches!(tick, Tick::Acknowledged) {
            slot.acknowledged = true;
            return;
        }
        match self.persist(AlarmState::disarmed(entity_id.clone())).await {
            Ok(()) => slot.pending_clear = false,
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "alarm flag clear failed; will retry");
                slot.pending_clear = true;
            }
        }
    }
}

async fn run_reminders(inner: Arc<SchedulerInner>, entity_id: EntityId, generation: u64, mut persisted: bool) {
    let period = inner.reminder_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match inner.reminder_tick(&entity_id, &mut persisted).await {
            Tick::Continue => {}
            tick => {
                inner.finish_reminder(&entity_id, generation, tick).await;
                return;
            }
        }
    }
}

/// Sends exit alerts and keeps reminding until the entity is back or the
/// owner stops tracking.
pub struct AlertScheduler {
    inner: Arc<SchedulerInner>,
}

impl AlertScheduler {
    /// Creates a scheduler with the given reminder period and store timeout.
    #[must_use]
    pub fn new(
        alarms: Arc<dyn AlarmStore>,
        sink: Arc<dyn NotificationSink>,
        evaluator: Arc<ContainmentEvaluator>,
        reminder_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                alarms,
                sink,
                evaluator,
                reminder_interval,
                timeout,
                slots: DashMap::new(),
            }),
        }
    }

    fn start_timer(&self, slot: &mut AlarmSlot, entity_id: &EntityId, persisted: bool) {
        slot.stop_timer();
        slot.pending_clear = false;
        slot.acknowledged = false;
        let generation = slot.generation;
        slot.reminder = Some(tokio::spawn(run_reminders(
            Arc::clone(&self.inner),
            entity_id.clone(),
            generation,
            persisted,
        )));
    }

    /// Handles an EXIT: persist the flag, alert now, then remind on a fixed period.
    ///
    /// Never fails; storage and delivery problems are logged and retried on
    /// the reminder cadence.
    pub async fn on_exit(&self, entity_id: &EntityId, distance_meters: Option<f64>) {
        let slot = self.inner.slot(entity_id);
        let mut slot = slot.lock().await;

        let persisted = match self.inner.persist(AlarmState::armed(entity_id.clone())).await {
            Ok(()) => true,
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "alarm flag not persisted; alerting anyway");
                false
            }
        };

        if let Err(e) = self
            .inner
            .send(Alert::new(entity_id.clone(), AlertKind::Exit, distance_meters))
            .await
        {
            warn!(entity_id = %entity_id, error = %e, "exit alert not delivered; reminders will follow");
        }

        self.start_timer(&mut slot, entity_id, persisted);
        info!(entity_id = %entity_id, "alarm armed");
    }

    /// Handles an ENTER: stop reminders and clear the flag. Idempotent.
    ///
    /// # Errors
    /// Returns the storage error if the flag could not be cleared; the clear
    /// is remembered and retried by [`AlertScheduler::retry_pending_clear`].
    pub async fn on_enter(&self, entity_id: &EntityId) -> FenceResult<()> {
        self.disarm(entity_id, "entity back inside", false).await
    }

    /// Explicit owner cancellation.
    ///
    /// Like [`AlertScheduler::on_enter`], but the current outside episode is
    /// also marked acknowledged so [`AlertScheduler::ensure_armed`] will not
    /// restart reminders until the next EXIT.
    ///
    /// # Errors
    /// Same as [`AlertScheduler::on_enter`].
    pub async fn cancel(&self, entity_id: &EntityId) -> FenceResult<()> {
        self.disarm(entity_id, "cancelled", true).await
    }

    async fn disarm(
        &self,
        entity_id: &EntityId,
        reason: &'static str,
        acknowledge: bool,
    ) -> FenceResult<()> {
        let slot = self.inner.slot(entity_id);
        let mut slot = slot.lock().await;
        let stopped = slot.stop_timer();
        slot.acknowledged = acknowledge;

        match self.inner.persist(AlarmState::disarmed(entity_id.clone())).await {
            Ok(()) => {
                slot.pending_clear = false;
                if stopped {
                    info!(entity_id = %entity_id, reason, "alarm disarmed");
                }
                Ok(())
            }
            Err(e) => {
                slot.pending_clear = true;
                warn!(entity_id = %entity_id, error = %e, reason, "reminders stopped but alarm flag not cleared");
                Err(e)
            }
        }
    }

    /// Retries a previously failed flag clear, if any.
    ///
    /// # Errors
    /// The storage error if the clear failed again.
    pub async fn retry_pending_clear(&self, entity_id: &EntityId) -> FenceResult<bool> {
        let slot = self.inner.slot(entity_id);
        let mut slot = slot.lock().await;
        if !slot.pending_clear || slot.is_running() {
            return Ok(false);
        }
        self.inner
            .persist(AlarmState::disarmed(entity_id.clone()))
            .await?;
        slot.pending_clear = false;
        debug!(entity_id = %entity_id, "pending alarm clear persisted");
        Ok(true)
    }

    /// Makes sure reminders are running without sending an immediate alert.
    ///
    /// Used when the entity is known to be outside but no timer is active,
    /// e.g. after a reminder tick raced with a brief return inside. Does
    /// nothing once the episode was acknowledged.
    pub async fn ensure_armed(&self, entity_id: &EntityId) -> bool {
        let slot = self.inner.slot(entity_id);
        let mut slot = slot.lock().await;
        if slot.is_running() || slot.acknowledged {
            return false;
        }
        let persisted = match self.inner.persist(AlarmState::armed(entity_id.clone())).await {
            Ok(()) => true,
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "alarm flag not persisted on re-arm");
                false
            }
        };
        self.start_timer(&mut slot, entity_id, persisted);
        info!(entity_id = %entity_id, "alarm re-armed");
        true
    }

    /// Restarts reminders for one entity if its persisted flag is armed.
    ///
    /// No immediate alert is sent; the first reminder fires one interval later.
    ///
    /// # Errors
    /// The storage error if the flag could not be read.
    pub async fn resume(&self, entity_id: &EntityId) -> FenceResult<bool> {
        let armed = bounded(self.inner.timeout, "alarm read", self.inner.alarms.is_armed(entity_id)).await?;
        if !armed {
            return Ok(false);
        }
        let slot = self.inner.slot(entity_id);
        let mut slot = slot.lock().await;
        if !slot.is_running() {
            self.start_timer(&mut slot, entity_id, true);
            info!(entity_id = %entity_id, "alarm resumed");
        }
        Ok(true)
    }

    /// Restarts reminders for every persisted armed flag.
    ///
    /// # Errors
    /// The storage error if the flags could not be listed.
    pub async fn resume_armed(&self) -> FenceResult<Vec<EntityId>> {
        let armed = bounded(self.inner.timeout, "alarm list", self.inner.alarms.list_armed()).await?;
        for entity_id in &armed {
            let slot = self.inner.slot(entity_id);
            let mut slot = slot.lock().await;
            if !slot.is_running() {
                self.start_timer(&mut slot, entity_id, true);
            }
        }
        if !armed.is_empty() {
            info!(count = armed.len(), "resumed armed alarms");
        }
        Ok(armed)
    }

    /// Stops every reminder timer, leaving persisted flags untouched.
    pub async fn suspend_all(&self) {
        let slots: Vec<_> = self
            .inner
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for slot in slots {
            slot.lock().await.stop_timer();
        }
    }

    /// Whether a reminder timer is running for the entity.
    pub async fn is_armed(&self, entity_id: &EntityId) -> bool {
        let Some(slot) = self.inner.slots.get(entity_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let slot = slot.lock().await;
        slot.is_running()
    }

    /// Whether a failed flag clear is waiting to be retried.
    pub async fn has_pending_clear(&self, entity_id: &EntityId) -> bool {
        let Some(slot) = self.inner.slots.get(entity_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let slot = slot.lock().await;
        slot.pending_clear
    }

    /// Drops the entity's slot once it is idle.
    ///
    /// A slot with a running timer or a flag clear still to retry is kept.
    /// Returns true if the slot was removed.
    pub fn forget(&self, entity_id: &EntityId) -> bool {
        self.inner
            .slots
            .remove_if(entity_id, |_, slot| {
                slot.try_lock()
                    .is_ok_and(|s| !s.is_running() && !s.pending_clear)
            })
            .is_some()
    }

    #[cfg(test)]
    pub(crate) fn tracked_entities(&self) -> usize {
        self.inner.slots.len()
    }

    /// Reminder period.
    #[must_use]
    pub fn reminder_interval(&self) -> Duration {
        self.inner.reminder_interval
    }
}

impl std::fmt::Debug for AlertScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertScheduler")
            .field("reminder_interval", &self.inner.reminder_interval)
            .field("entities", &self.inner.slots.len())
            .finish_non_exhaustive()
    }
}

impl Drop for AlertScheduler {
    fn drop(&mut self) {
        for entry in &self.inner.slots {
            if let Ok(mut slot) = entry.value().try_lock() {
                slot.stop_timer();
            }
        }
    }
}
