//! Notification sink abstraction.
//!
//! The monitor only ever calls [`NotificationSink::send_alert`]; channel and
//! permission management belong to the host application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::entity::EntityId;

/// Why an alert was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// First alert for an exit.
    Exit,
    /// Repeat while the entity stays outside.
    Reminder,
}

/// A user-facing alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique per delivery attempt.
    pub alert_id: Uuid,
    /// Entity the alert is about.
    pub entity_id: EntityId,
    /// Exit or reminder.
    pub kind: AlertKind,
    /// Human readable text.
    pub message: String,
    /// Last known distance from the zone center, if any.
    pub distance_meters: Option<f64>,
    /// When the alert was handed to the sink.
    pub sent_at: DateTime<Utc>,
}

impl Alert {
    /// Builds an alert with the standard message for `kind`.
    #[must_use]
    pub fn new(entity_id: EntityId, kind: AlertKind, distance_meters: Option<f64>) -> Self {
        let message = match (kind, distance_meters) {
            (AlertKind::Exit, Some(d)) => {
                format!("{entity_id} left its safe zone ({d:.0} m from center)")
            }
            (AlertKind::Exit, None) => format!("{entity_id} left its safe zone"),
            (AlertKind::Reminder, Some(d)) => {
                format!("{entity_id} is still outside its safe zone ({d:.0} m from center)")
            }
            (AlertKind::Reminder, None) => format!("{entity_id} is still outside its safe zone"),
        };
        Self {
            alert_id: Uuid::new_v4(),
            entity_id,
            kind,
            message,
            distance_meters,
            sent_at: Utc::now(),
        }
    }
}

/// Delivery failure reported by a sink.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Platform notification delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Delivers one alert.
    async fn send_alert(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Sink that keeps every delivered alert in memory, with failure injection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
    failing: AtomicBool,
}

impl RecordingSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent deliveries fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Every successfully delivered alert, oldest first.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Delivered alerts for one entity.
    #[must_use]
    pub fn alerts_for(&self, entity_id: &EntityId) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|a| &a.entity_id == entity_id)
            .collect()
    }

    /// Number of delivered alerts of `kind`.
    #[must_use]
    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts().iter().filter(|a| a.kind == kind).count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_alert(&self, alert: &Alert) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(NotifyError::Unavailable("recording sink set to fail".into()));
        }
        self.alerts
            .lock()
            .map_err(|_| NotifyError::Unavailable("poisoned lock".into()))?
            .push(alert.clone());
        Ok(())
    }
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn send_alert(&self, alert: &Alert) -> Result<(), NotifyError> {
        info!(
            entity_id = %alert.entity_id,
            kind = ?alert.kind,
            alert_id = %alert.alert_id,
            "{}",
            alert.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sink_records_and_fails_on_demand() {
        let sink = RecordingSink::new();
        let rex = EntityId::new("rex").unwrap();
        sink.send_alert(&Alert::new(rex.clone(), AlertKind::Exit, Some(1_112.0)))
            .await
            .unwrap();

        sink.set_failing(true);
        let err = sink
            .send_alert(&Alert::new(rex.clone(), AlertKind::Reminder, None))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Unavailable(_)));

        assert_eq!(sink.count(AlertKind::Exit), 1);
        assert_eq!(sink.count(AlertKind::Reminder), 0);
        assert_eq!(sink.alerts_for(&rex).len(), 1);
    }

    #[test]
    fn alert_message_mentions_distance() {
        let alert = Alert::new(EntityId::new("rex").unwrap(), AlertKind::Exit, Some(1_111.9));
        assert_eq!(alert.message, "rex left its safe zone (1112 m from center)");
    }
}
