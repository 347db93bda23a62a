//! Refresh-ahead instance cache.
//!
//! One entry per service id, loaded through the [`EndpointResolver`]. The
//! first read for a key blocks for one upstream round trip; reads past the
//! freshness interval return the previous value immediately and reload in
//! the background (stale-while-revalidate). A per-key async lock guarantees
//! a single in-flight load per key, so concurrent callers coalesce onto one
//! upstream fetch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::catalog::ServiceCatalog;
use crate::error::DiscoveryError;
use crate::resolver::{EndpointResolver, ServiceInstance};

/// Cached instance list with its load time
#[derive(Clone)]
struct CacheEntry {
    instances: Arc<Vec<ServiceInstance>>,
    refreshed_at: Instant,
}

impl CacheEntry {
    fn new(instances: Vec<ServiceInstance>) -> Self {
        Self {
            instances: Arc::new(instances),
            refreshed_at: Instant::now(),
        }
    }
}

/// Per-key cache state.
///
/// `load` serializes loads for the key: the synchronous first load holds it
/// across the upstream call, background reloads take it with `try_lock` and
/// bail out when a load is already in flight.
struct CacheSlot {
    value: RwLock<Option<CacheEntry>>,
    load: Mutex<()>,
}

impl CacheSlot {
    fn new() -> Self {
        Self {
            value: RwLock::new(None),
            load: Mutex::new(()),
        }
    }
}

/// Per-service cache of resolved instances
pub struct InstanceCache {
    catalog: Arc<ServiceCatalog>,
    resolver: Arc<EndpointResolver>,
    slots: Arc<DashMap<String, Arc<CacheSlot>>>,
    refresh_interval: Duration,
}

impl InstanceCache {
    /// Create a cache resolving through the given resolver, consulting the
    /// catalog for key validity.
    pub fn new(
        catalog: Arc<ServiceCatalog>,
        resolver: Arc<EndpointResolver>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            catalog,
            resolver,
            slots: Arc::new(DashMap::new()),
            refresh_interval,
        }
    }

    /// Current instances of a service.
    ///
    /// Empty for a blank or uncataloged id, without any upstream call.
    /// Recoverable load failures also surface as empty; the only error a
    /// caller can see is the fatal port-selection configuration error.
    pub async fn get(
        &self,
        service_id: &str,
    ) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        if service_id.is_empty() {
            warn!("instance query without a service id");
            return Ok(Vec::new());
        }
        if self.catalog.lookup(service_id).await.is_none() {
            warn!(service_id = %service_id, "unknown service id");
            // The key may have been cataloged earlier; its entry is stale now.
            self.slots.remove(service_id);
            return Ok(Vec::new());
        }

        let slot = self
            .slots
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(CacheSlot::new()))
            .clone();

        if let Some(entry) = slot.value.read().await.clone() {
            if entry.refreshed_at.elapsed() >= self.refresh_interval {
                self.spawn_reload(service_id, &slot);
            }
            return Ok(entry.instances.as_ref().clone());
        }

        // First load for this key: block for one upstream round trip.
        let _guard = slot.load.lock().await;
        if let Some(entry) = slot.value.read().await.clone() {
            // Another caller loaded while we waited for the lock.
            return Ok(entry.instances.as_ref().clone());
        }
        self.load(service_id, &slot).await
    }

    /// Load instances for a key while holding its load lock.
    ///
    /// A recoverable failure leaves the slot empty so the next read retries
    /// synchronously, matching the first-load path.
    async fn load(
        &self,
        service_id: &str,
        slot: &CacheSlot,
    ) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        // The descriptor is looked up at load time; the service may have left
        // the catalog since the caller's validity check.
        let Some(descriptor) = self.catalog.lookup(service_id).await else {
            warn!(service_id = %service_id, "service left the catalog before load");
            self.slots.remove(service_id);
            return Ok(Vec::new());
        };

        match self.resolver.resolve(&descriptor).await {
            Ok(instances) => {
                *slot.value.write().await = Some(CacheEntry::new(instances.clone()));
                Ok(instances)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "failed to load instances");
                Ok(Vec::new())
            }
        }
    }

    /// Kick off an asynchronous reload for a stale key.
    ///
    /// Skipped when a load is already in flight. A failed reload keeps the
    /// previous value; the entry stays stale, so the next read tries again.
    fn spawn_reload(&self, service_id: &str, slot: &Arc<CacheSlot>) {
        let service_id = service_id.to_string();
        let slot = slot.clone();
        let catalog = self.catalog.clone();
        let resolver = self.resolver.clone();
        let slots = self.slots.clone();

        tokio::spawn(async move {
            let Ok(_guard) = slot.load.try_lock() else {
                return;
            };
            let Some(descriptor) = catalog.lookup(&service_id).await else {
                slots.remove(&service_id);
                return;
            };
            match resolver.resolve(&descriptor).await {
                Ok(instances) => {
                    *slot.value.write().await = Some(CacheEntry::new(instances));
                }
                Err(e) => {
                    warn!(service_id = %service_id, error = %e, "instance refresh failed, keeping previous value");
                }
            }
        });
    }
}
