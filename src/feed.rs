//! Position feed: ingestion and fan-out of location samples.
//!
//! Samples arrive two ways: pushed by the owner's device location stack
//! through [`PositionFeed::report_position`], or pulled from a shared
//! last-known-position store through [`PositionFeed::refresh`]. Both paths
//! go through the same validation and ordering filter; only samples newer
//! than the latest accepted one are kept and delivered. Samples stamped
//! further ahead of the local clock than the configured skew are rejected
//! so a bad device clock cannot pin the latest sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::entity::EntityId;
use crate::error::{FenceError, FenceResult, ValidationError};
use crate::position::PositionSample;
use crate::storage::PositionStore;

/// Callback invoked with every accepted sample for a subscribed entity.
pub type SampleCallback = Arc<dyn Fn(&PositionSample) + Send + Sync>;

/// Latest-sample cache plus one subscriber per entity.
pub struct PositionFeed {
    latest: DashMap<EntityId, PositionSample>,
    subscribers: DashMap<EntityId, SampleCallback>,
    store: Option<Arc<dyn PositionStore>>,
    timeout: Duration,
    max_clock_skew: Duration,
    rejected: AtomicU64,
}

/// Default tolerance for device clocks running ahead of ours.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);

impl PositionFeed {
    /// Creates a push-only feed.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            latest: DashMap::new(),
            subscribers: DashMap::new(),
            store: None,
            timeout,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            rejected: AtomicU64::new(0),
        }
    }

    /// Sets how far past the local clock a sample's timestamp may be.
    #[must_use]
    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    /// Creates a feed that can also pull from a shared position store.
    #[must_use]
    pub fn with_store(store: Arc<dyn PositionStore>, timeout: Duration) -> Self {
        Self {
            store: Some(store),
            ..Self::new(timeout)
        }
    }

    /// Ingests a pushed sample.
    ///
    /// Returns `Ok(true)` if the sample became the entity's latest, `Ok(false)`
    /// if it was a duplicate or older than what is already known.
    ///
    /// # Errors
    /// Malformed coordinates and timestamps too far in the future are
    /// rejected and the sample is discarded.
    pub fn report_position(&self, sample: PositionSample) -> FenceResult<bool> {
        if let Err(e) = sample.validate().and_then(|()| self.check_clock(&sample)) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(entity_id = %sample.entity_id, error = %e, "discarding malformed sample");
            return Err(e.into());
        }

        let accepted = match self.latest.entry(sample.entity_id.clone()) {
            Entry::Occupied(mut current) => {
                if sample.captured_at <= current.get().captured_at {
                    false
                } else {
                    current.insert(sample.clone());
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(sample.clone());
                true
            }
        };

        if !accepted {
            debug!(entity_id = %sample.entity_id, captured_at = %sample.captured_at, "ignoring stale or duplicate sample");
            return Ok(false);
        }

        let callback = self
            .subscribers
            .get(&sample.entity_id)
            .map(|cb| Arc::clone(cb.value()));
        if let Some(callback) = callback {
            callback(&sample);
        }
        Ok(true)
    }

    fn check_clock(&self, sample: &PositionSample) -> Result<(), ValidationError> {
        let Ok(skew) = chrono::Duration::from_std(self.max_clock_skew) else {
            return Ok(());
        };
        match Utc::now().checked_add_signed(skew) {
            Some(limit) if sample.captured_at > limit => Err(ValidationError::SampleFromFuture {
                captured_at: sample.captured_at,
                max_skew_ms: u64::try_from(self.max_clock_skew.as_millis()).unwrap_or(u64::MAX),
            }),
            _ => Ok(()),
        }
    }

    /// Pulls the entity's last known position from the shared store.
    ///
    /// Returns `Ok(false)` when there is no store, no stored position, or
    /// nothing newer than what the feed already has.
    ///
    /// # Errors
    /// Storage failures, timeouts, and malformed or misrouted stored samples.
    pub async fn refresh(&self, entity_id: &EntityId) -> FenceResult<bool> {
        let Some(store) = self.store.as_ref() else {
            return Ok(false);
        };

        let sample = match timeout(self.timeout, store.latest_position(entity_id)).await {
            Ok(Ok(Some(sample))) => sample,
            Ok(Ok(None)) => return Ok(false),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(FenceError::timeout("position fetch", self.timeout)),
        };

        if &sample.entity_id != entity_id {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ValidationError::EntityMismatch {
                expected: entity_id.clone(),
                actual: sample.entity_id,
            }
            .into());
        }

        self.report_position(sample)
    }

    /// Registers the entity's subscriber, replacing any previous one.
    ///
    /// The latest known sample, if any, is delivered immediately so a late
    /// subscriber does not wait for the next physical movement.
    pub fn subscribe(&self, entity_id: &EntityId, on_sample: SampleCallback) {
        self.subscribers.insert(entity_id.clone(), Arc::clone(&on_sample));
        let latest = self.latest(entity_id);
        if let Some(sample) = latest {
            on_sample(&sample);
        }
    }

    /// Stops delivery for the entity. Idempotent.
    ///
    /// Returns true if a subscriber was removed.
    pub fn unsubscribe(&self, entity_id: &EntityId) -> bool {
        self.subscribers.remove(entity_id).is_some()
    }

    /// Latest accepted sample for the entity.
    #[must_use]
    pub fn latest(&self, entity_id: &EntityId) -> Option<PositionSample> {
        self.latest.get(entity_id).map(|s| s.value().clone())
    }

    /// Number of samples discarded as malformed or misrouted.
    #[must_use]
    pub fn rejected_samples(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PositionFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionFeed")
            .field("tracked", &self.latest.len())
            .field("subscribers", &self.subscribers.len())
            .field("pull", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{Duration as ChronoDuration, Utc};

    use crate::geo::Coordinate;
    use crate::storage::InMemoryPositionStore;

    fn rex() -> EntityId {
        EntityId::new("rex").unwrap()
    }

    fn recorder() -> (SampleCallback, Arc<Mutex<Vec<PositionSample>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: SampleCallback = Arc::new(move |s: &PositionSample| {
            sink.lock().unwrap().push(s.clone());
        });
        (cb, seen)
    }

    #[test]
    fn out_of_order_and_duplicate_samples_are_ignored() {
        let feed = PositionFeed::new(Duration::from_secs(1));
        let t0 = Utc::now();
        let newer = PositionSample::new(rex(), 1.0, 1.0, t0).unwrap();
        let older = PositionSample::new(rex(), 2.0, 2.0, t0 - ChronoDuration::seconds(5)).unwrap();

        assert!(feed.report_position(newer.clone()).unwrap());
        assert!(!feed.report_position(newer.clone()).unwrap());
        assert!(!feed.report_position(older).unwrap());
        assert_eq!(feed.latest(&rex()), Some(newer));
    }

    #[test]
    fn malformed_sample_is_rejected_and_not_stored() {
        let feed = PositionFeed::new(Duration::from_secs(1));
        let bad = PositionSample {
            entity_id: rex(),
            coordinate: Coordinate::new(f64::NAN, 0.0),
            captured_at: Utc::now(),
        };
        assert!(feed.report_position(bad).unwrap_err().is_validation());
        assert!(feed.latest(&rex()).is_none());
        assert_eq!(feed.rejected_samples(), 1);
    }

    #[test]
    fn far_future_sample_cannot_pin_the_feed() {
        let feed = PositionFeed::new(Duration::from_secs(1))
            .with_max_clock_skew(Duration::from_secs(60));
        let now = Utc::now();
        let skewed = PositionSample::new(rex(), 0.0, 0.0, now + ChronoDuration::days(365)).unwrap();
        let err = feed.report_position(skewed).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(feed.rejected_samples(), 1);
        assert!(feed.latest(&rex()).is_none());

        // Within tolerance: slightly ahead is still accepted.
        let ahead = PositionSample::new(rex(), 0.0, 0.01, now + ChronoDuration::seconds(5)).unwrap();
        assert!(feed.report_position(ahead.clone()).unwrap());
        assert_eq!(feed.latest(&rex()), Some(ahead));
    }

    #[test]
    fn subscribe_replays_latest_sample() {
        let feed = PositionFeed::new(Duration::from_secs(1));
        let sample = PositionSample::now(rex(), 3.0, 4.0).unwrap();
        feed.report_position(sample.clone()).unwrap();

        let (cb, seen) = recorder();
        feed.subscribe(&rex(), cb);
        assert_eq!(seen.lock().unwrap().as_slice(), &[sample]);
    }

    #[test]
    fn unsubscribe_stops_delivery_and_is_idempotent() {
        let feed = PositionFeed::new(Duration::from_secs(1));
        let (cb, seen) = recorder();
        feed.subscribe(&rex(), cb);

        let t0 = Utc::now();
        feed.report_position(PositionSample::new(rex(), 0.0, 0.0, t0).unwrap())
            .unwrap();
        assert!(feed.unsubscribe(&rex()));
        assert!(!feed.unsubscribe(&rex()));
        feed.report_position(
            PositionSample::new(rex(), 0.0, 0.1, t0 + ChronoDuration::seconds(1)).unwrap(),
        )
        .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_pulls_from_shared_store() {
        let store = Arc::new(InMemoryPositionStore::new());
        let feed = PositionFeed::with_store(
            Arc::clone(&store) as Arc<dyn PositionStore>,
            Duration::from_secs(1),
        );
        assert!(!feed.refresh(&rex()).await.unwrap());

        let sample = PositionSample::now(rex(), 5.0, 6.0).unwrap();
        store.put(sample.clone()).unwrap();
        assert!(feed.refresh(&rex()).await.unwrap());
        assert!(!feed.refresh(&rex()).await.unwrap());
        assert_eq!(feed.latest(&rex()), Some(sample));
    }

    #[tokio::test]
    async fn refresh_only_sees_own_entity() {
        let store = Arc::new(InMemoryPositionStore::new());
        let feed = PositionFeed::with_store(
            Arc::clone(&store) as Arc<dyn PositionStore>,
            Duration::from_secs(1),
        );
        let other = EntityId::new("fido").unwrap();
        store.put(PositionSample::now(other.clone(), 1.0, 1.0).unwrap()).unwrap();
        assert!(!feed.refresh(&rex()).await.unwrap());
        assert!(feed.refresh(&other).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_times_out() {
        let store = Arc::new(InMemoryPositionStore::new());
        store.set_latency(Duration::from_secs(30));
        let feed = PositionFeed::with_store(
            Arc::clone(&store) as Arc<dyn PositionStore>,
            Duration::from_secs(1),
        );
        let err = feed.refresh(&rex()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
