//! Safe zone cache in front of the remote zone back-end.
//!
//! Reads prefer availability: when the back-end is slow or unreachable the
//! last known zone is served with `stale = true`. Edits update the cache
//! first and then persist remotely; a failed remote write is reported to the
//! caller but the local edit stays in effect and is re-pushed on later reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::entity::EntityId;
use crate::error::{ExecutionError, FenceError, FenceResult};
use crate::geo::SafeZone;
use crate::storage::ZoneBackend;

/// Result of a zone read.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneLookup {
    /// Active zone, `None` if the entity has no zone configured.
    pub zone: Option<SafeZone>,
    /// True when the value could not be confirmed against the back-end.
    pub stale: bool,
    /// Cache revision; changes whenever the cached zone changes.
    pub revision: u64,
}

#[derive(Debug, Clone)]
struct CachedZone {
    zone: Option<SafeZone>,
    fetched_at: Instant,
    revision: u64,
    /// Local edit not yet confirmed by the back-end.
    dirty: bool,
}

impl CachedZone {
    fn lookup(&self, stale: bool) -> ZoneLookup {
        ZoneLookup {
            zone: self.zone.clone(),
            stale,
            revision: self.revision,
        }
    }
}

/// Per-entity zone cache backed by a remote [`ZoneBackend`].
pub struct ZoneStore {
    backend: Arc<dyn ZoneBackend>,
    ttl: Duration,
    timeout: Duration,
    cache: DashMap<EntityId, CachedZone>,
    key_locks: DashMap<EntityId, Arc<Mutex<()>>>,
    next_revision: AtomicU64,
}

impl ZoneStore {
    /// Creates a store with the given cache TTL and remote call timeout.
    pub fn new(backend: Arc<dyn ZoneBackend>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            backend,
            ttl,
            timeout,
            cache: DashMap::new(),
            key_locks: DashMap::new(),
            next_revision: AtomicU64::new(1),
        }
    }

    fn bump_revision(&self) -> u64 {
        self.next_revision.fetch_add(1, Ordering::Relaxed)
    }

    fn key_lock(&self, entity_id: &EntityId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.key_locks
                .entry(entity_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn fresh_entry(&self, entity_id: &EntityId) -> Option<ZoneLookup> {
        let cached = self.cache.get(entity_id)?;
        if !cached.dirty && cached.fetched_at.elapsed() < self.ttl {
            Some(cached.lookup(false))
        } else {
            None
        }
    }

    /// Reads the active zone for an entity.
    ///
    /// Serves a fresh cached value without I/O; otherwise refetches with a
    /// bounded timeout and falls back to the stale cached value on failure.
    ///
    /// # Errors
    /// `ExecutionError::ZoneUnavailable` only when the back-end failed and
    /// nothing was ever cached for the entity.
    pub async fn get_zone(&self, entity_id: &EntityId) -> FenceResult<ZoneLookup> {
        if let Some(hit) = self.fresh_entry(entity_id) {
            return Ok(hit);
        }

        let lock = self.key_lock(entity_id);
        let _guard = lock.lock().await;

        // A concurrent refresh may have completed while we waited.
        if let Some(hit) = self.fresh_entry(entity_id) {
            return Ok(hit);
        }

        let cached = self.cache.get(entity_id).map(|c| c.value().clone());
        if let Some(cached) = cached.filter(|c| c.dirty) {
            return Ok(self.resync_dirty(entity_id, cached).await);
        }

        match timeout(self.timeout, self.backend.fetch_zone(entity_id)).await {
            Ok(Ok(fetched)) => {
                let fetched = match fetched {
                    Some(zone) if zone.validate().is_err() || &zone.entity_id != entity_id => {
                        warn!(entity_id = %entity_id, "back-end returned an invalid zone; ignoring it");
                        return self.fallback(entity_id, "invalid zone from back-end".to_string());
                    }
                    other => other,
                };
                Ok(self.store_fetched(entity_id, fetched))
            }
            Ok(Err(e)) => {
                warn!(entity_id = %entity_id, error = %e, "zone fetch failed");
                self.fallback(entity_id, e.to_string())
            }
            Err(_) => {
                warn!(entity_id = %entity_id, timeout_ms = self.timeout.as_millis() as u64, "zone fetch timed out");
                self.fallback(entity_id, "fetch timed out".to_string())
            }
        }
    }

    fn store_fetched(&self, entity_id: &EntityId, fetched: Option<SafeZone>) -> ZoneLookup {
        let now = Instant::now();
        let mut entry = self.cache.entry(entity_id.clone()).or_insert_with(|| CachedZone {
            zone: None,
            fetched_at: now,
            revision: 0,
            dirty: false,
        });
        if entry.revision == 0 || entry.zone != fetched {
            entry.revision = self.bump_revision();
            entry.zone = fetched;
            debug!(entity_id = %entity_id, revision = entry.revision, "zone cache updated from back-end");
        }
        entry.fetched_at = now;
        entry.lookup(false)
    }

    fn fallback(&self, entity_id: &EntityId, reason: String) -> FenceResult<ZoneLookup> {
        match self.cache.get(entity_id) {
            Some(cached) => Ok(cached.lookup(true)),
            None => Err(FenceError::Execution(ExecutionError::ZoneUnavailable {
                entity_id: entity_id.clone(),
                reason,
            })),
        }
    }

    async fn resync_dirty(&self, entity_id: &EntityId, cached: CachedZone) -> ZoneLookup {
        let Some(zone) = cached.zone.as_ref() else {
            return cached.lookup(true);
        };
        match timeout(self.timeout, self.backend.store_zone(zone)).await {
            Ok(Ok(())) => {
                if let Some(mut entry) = self.cache.get_mut(entity_id) {
                    if entry.revision == cached.revision {
                        entry.dirty = false;
                        entry.fetched_at = Instant::now();
                    }
                }
                debug!(entity_id = %entity_id, "pending zone edit persisted");
                cached.lookup(false)
            }
            Ok(Err(e)) => {
                warn!(entity_id = %entity_id, error = %e, "pending zone edit still not persisted");
                cached.lookup(true)
            }
            Err(_) => {
                warn!(entity_id = %entity_id, "pending zone edit persist timed out");
                cached.lookup(true)
            }
        }
    }

    /// Atomically replaces the active zone.
    ///
    /// The cache (and with it the evaluator's memo, keyed on the revision)
    /// switches to the new zone before the remote write starts, so the next
    /// evaluation uses it whatever the outcome of that write.
    ///
    /// # Errors
    /// Validation errors for a bad zone; storage or timeout errors when the
    /// remote write failed (the local edit is kept and retried later).
    pub async fn set_zone(&self, zone: SafeZone) -> FenceResult<()> {
        zone.validate()?;
        let entity_id = zone.entity_id.clone();

        let lock = self.key_lock(&entity_id);
        let _guard = lock.lock().await;

        let revision = self.bump_revision();
        self.cache.insert(
            entity_id.clone(),
            CachedZone {
                zone: Some(zone.clone()),
                fetched_at: Instant::now(),
                revision,
                dirty: true,
            },
        );

        match timeout(self.timeout, self.backend.store_zone(&zone)).await {
            Ok(Ok(())) => {
                if let Some(mut entry) = self.cache.get_mut(&entity_id) {
                    if entry.revision == revision {
                        entry.dirty = false;
                        entry.fetched_at = Instant::now();
                    }
                }
                debug!(entity_id = %entity_id, revision, radius_meters = zone.radius_meters, "zone replaced");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(entity_id = %entity_id, error = %e, "zone persisted locally only");
                Err(e.into())
            }
            Err(_) => {
                warn!(entity_id = %entity_id, "zone persist timed out; kept locally");
                Err(FenceError::timeout("zone store", self.timeout))
            }
        }
    }

    /// Releases the entity's refetch lock if no call is using it.
    ///
    /// The cached zone stays; owners edit zones of unmonitored pets too.
    pub fn release(&self, entity_id: &EntityId) -> bool {
        self.key_locks
            .remove_if(entity_id, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.key_locks.len()
    }

    /// Returns true if a local edit has not reached the back-end yet.
    #[must_use]
    pub fn has_pending_edit(&self, entity_id: &EntityId) -> bool {
        self.cache.get(entity_id).is_some_and(|c| c.dirty)
    }

    /// Drops the cached entry so the next read refetches.
    ///
    /// Pending local edits are kept.
    pub fn invalidate(&self, entity_id: &EntityId) {
        self.cache.remove_if(entity_id, |_, c| !c.dirty);
    }
}

impl std::fmt::Debug for ZoneStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneStore")
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;
    use crate::storage::InMemoryZoneBackend;

    fn rex() -> EntityId {
        EntityId::new("rex").unwrap()
    }

    fn zone(radius: f64) -> SafeZone {
        SafeZone::new(rex(), Coordinate::new(0.0, 0.0), radius).unwrap()
    }

    fn store(backend: &Arc<InMemoryZoneBackend>) -> ZoneStore {
        ZoneStore::new(
            Arc::clone(backend) as Arc<dyn ZoneBackend>,
            Duration::from_secs(60),
            Duration::from_secs(2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_hit_skips_backend() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        backend.insert(zone(100.0)).unwrap();
        let zones = store(&backend);

        let first = zones.get_zone(&rex()).await.unwrap();
        let second = zones.get_zone(&rex()).await.unwrap();
        assert_eq!(first, second);
        assert!(!second.stale);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_entity_reads_none() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        let zones = store(&backend);
        let lookup = zones.get_zone(&rex()).await.unwrap();
        assert!(lookup.zone.is_none());
        assert!(!lookup.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_serves_stale_cache() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        backend.insert(zone(100.0)).unwrap();
        let zones = store(&backend);
        zones.get_zone(&rex()).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        backend.set_offline(true);

        let lookup = zones.get_zone(&rex()).await.unwrap();
        assert!(lookup.stale);
        assert_eq!(lookup.zone.unwrap().radius_meters, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_without_cache_is_unavailable() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        backend.set_offline(true);
        let zones = store(&backend);
        let err = zones.get_zone(&rex()).await.unwrap_err();
        assert!(matches!(
            err,
            FenceError::Execution(ExecutionError::ZoneUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_to_stale_cache() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        backend.insert(zone(100.0)).unwrap();
        let zones = store(&backend);
        zones.get_zone(&rex()).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        backend.set_latency(Duration::from_secs(10));

        let started = Instant::now();
        let lookup = zones.get_zone(&rex()).await.unwrap();
        assert!(lookup.stale);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn set_zone_replaces_and_bumps_revision() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        backend.insert(zone(100.0)).unwrap();
        let zones = store(&backend);
        let before = zones.get_zone(&rex()).await.unwrap().revision;

        zones.set_zone(zone(250.0)).await.unwrap();
        let after = zones.get_zone(&rex()).await.unwrap();
        assert!(after.revision > before);
        assert_eq!(after.zone.unwrap().radius_meters, 250.0);
        assert_eq!(backend.peek(&rex()).unwrap().unwrap().radius_meters, 250.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_remote_write_keeps_local_edit_and_resyncs() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        backend.insert(zone(100.0)).unwrap();
        let zones = store(&backend);

        backend.set_offline(true);
        let err = zones.set_zone(zone(300.0)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(zones.has_pending_edit(&rex()));

        // While offline the optimistic edit is still what readers see.
        let lookup = zones.get_zone(&rex()).await.unwrap();
        assert_eq!(lookup.zone.unwrap().radius_meters, 300.0);
        assert!(lookup.stale);

        backend.set_offline(false);
        let lookup = zones.get_zone(&rex()).await.unwrap();
        assert!(!lookup.stale);
        assert!(!zones.has_pending_edit(&rex()));
        assert_eq!(backend.peek(&rex()).unwrap().unwrap().radius_meters, 300.0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_change_is_picked_up_after_ttl() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        backend.insert(zone(100.0)).unwrap();
        let zones = store(&backend);
        let first = zones.get_zone(&rex()).await.unwrap();

        backend.insert(zone(500.0)).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let second = zones.get_zone(&rex()).await.unwrap();
        assert_ne!(first.revision, second.revision);
        assert_eq!(second.zone.unwrap().radius_meters, 500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_refetch() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        backend.insert(zone(100.0)).unwrap();
        let zones = store(&backend);
        zones.get_zone(&rex()).await.unwrap();
        zones.invalidate(&rex());
        zones.get_zone(&rex()).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn release_drops_idle_refetch_lock_but_keeps_zone() {
        let backend = Arc::new(InMemoryZoneBackend::new());
        backend.insert(zone(100.0)).unwrap();
        let zones = store(&backend);
        zones.get_zone(&rex()).await.unwrap();
        assert_eq!(zones.tracked_locks(), 1);

        assert!(zones.release(&rex()));
        assert!(!zones.release(&rex()));
        assert_eq!(zones.tracked_locks(), 0);
        let lookup = zones.get_zone(&rex()).await.unwrap();
        assert_eq!(lookup.zone.unwrap().radius_meters, 100.0);
        assert_eq!(backend.calls(), 1);
    }
}
