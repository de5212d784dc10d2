//! Monitoring configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FenceError, ValidationError};

/// Tunables for the monitoring core.
///
/// The evaluation tick drives re-checks even when no new sample arrives;
/// the reminder interval is the cadence of repeat alerts while an entity
/// stays outside its zone.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Period of the per-entity evaluation loop.
    pub evaluation_interval_ms: u64,
    /// Period of repeat alerts while armed.
    pub reminder_interval_ms: u64,
    /// Upper bound for any single remote store or notification call.
    pub store_timeout_ms: u64,
    /// How long a fetched zone is served from cache before refetching.
    pub zone_cache_ttl_ms: u64,
    /// Per-subscriber event stream buffer capacity.
    pub event_stream_capacity: usize,
    /// Max transition events queued per entity while the status store is down.
    pub max_pending_events: usize,
    /// How far ahead of the local clock a sample timestamp may be.
    pub max_clock_skew_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 5_000,
            reminder_interval_ms: 30_000,
            store_timeout_ms: 2_000,
            zone_cache_ttl_ms: 60_000,
            event_stream_capacity: 1024,
            max_pending_events: 256,
            max_clock_skew_ms: 300_000,
        }
    }
}

impl MonitorConfig {
    /// Checks that every interval, timeout and capacity is non-zero.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidConfig` naming the first bad field.
    pub fn validate(self) -> Result<Self, FenceError> {
        let checks: [(&str, u64); 5] = [
            ("evaluation_interval_ms", self.evaluation_interval_ms),
            ("reminder_interval_ms", self.reminder_interval_ms),
            ("store_timeout_ms", self.store_timeout_ms),
            ("zone_cache_ttl_ms", self.zone_cache_ttl_ms),
            ("max_clock_skew_ms", self.max_clock_skew_ms),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.event_stream_capacity == 0 {
            return Err(invalid("event_stream_capacity", "must be greater than zero"));
        }
        if self.max_pending_events == 0 {
            return Err(invalid("max_pending_events", "must be greater than zero"));
        }
        Ok(self)
    }

    /// Parses and validates a JSON document. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns a validation error for malformed JSON or bad values.
    pub fn from_json_str(json: &str) -> Result<Self, FenceError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| invalid("<document>", &e.to_string()))?;
        cfg.validate()
    }

    /// Period of the per-entity evaluation loop.
    #[must_use]
    pub const fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    /// Cadence of repeat alerts.
    #[must_use]
    pub const fn reminder_interval(&self) -> Duration {
        Duration::from_millis(self.reminder_interval_ms)
    }

    /// Bound applied to every remote call.
    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Freshness window of cached zones.
    #[must_use]
    pub const fn zone_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.zone_cache_ttl_ms)
    }

    /// Tolerance for sample timestamps ahead of the local clock.
    #[must_use]
    pub const fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms)
    }
}

fn invalid(field: &str, reason: &str) -> FenceError {
    FenceError::Validation(ValidationError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = MonitorConfig::default().validate().unwrap();
        assert_eq!(cfg.evaluation_interval(), Duration::from_secs(5));
        assert_eq!(cfg.reminder_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let cfg = MonitorConfig {
            reminder_interval_ms: 0,
            ..MonitorConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("reminder_interval_ms"));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let cfg = MonitorConfig::from_json_str(r#"{"evaluation_interval_ms": 1000}"#).unwrap();
        assert_eq!(cfg.evaluation_interval_ms, 1000);
        assert_eq!(cfg.reminder_interval_ms, 30_000);
    }

    #[test]
    fn test_zero_clock_skew_rejected() {
        let err = MonitorConfig::from_json_str(r#"{"max_clock_skew_ms": 0}"#).unwrap_err();
        assert!(err.to_string().contains("max_clock_skew_ms"));
        assert_eq!(MonitorConfig::default().max_clock_skew(), Duration::from_secs(300));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(MonitorConfig::from_json_str("not json").unwrap_err().is_validation());
        assert!(MonitorConfig::from_json_str(r#"{"store_timeout_ms": 0}"#).is_err());
    }
}
