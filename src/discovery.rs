//! Public discovery surface.
//!
//! [`KubernetesDiscovery`] wires the catalog, resolver and instance cache
//! together and owns the background refresh task. Construct it once, inject
//! it into consumers, and call [`KubernetesDiscovery::shutdown`] (or drop it)
//! to stop the scheduled scans.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::InstanceCache;
use crate::catalog::{ServiceCatalog, ServicesUpdate};
use crate::client::ClientRegistry;
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::resolver::{EndpointResolver, ServiceInstance};

/// Queryable view of the cluster federation's service topology.
///
/// Resolution is two-level: the periodically refreshed catalog answers "which
/// services exist", the refresh-ahead cache answers "which instances back
/// this service". Construction runs one synchronous catalog scan, so queries
/// work immediately.
pub struct KubernetesDiscovery {
    catalog: Arc<ServiceCatalog>,
    cache: InstanceCache,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl KubernetesDiscovery {
    /// Build the full discovery stack from configuration, creating one
    /// Kubernetes client per configured namespace.
    pub async fn new(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let registry = Arc::new(ClientRegistry::from_config(&config.clusters).await?);
        Ok(Self::with_registry(registry, config).await)
    }

    /// Build the discovery stack over a pre-constructed client registry.
    ///
    /// Used by tests and by hosts that manage client construction themselves.
    pub async fn with_registry(registry: Arc<ClientRegistry>, config: &DiscoveryConfig) -> Self {
        let exclude: HashSet<String> = config.exclude_services.iter().cloned().collect();
        let catalog = ServiceCatalog::new(registry.clone(), exclude).await;
        let refresh_task = catalog.start(config.service_interval());

        let resolver = Arc::new(EndpointResolver::new(
            registry,
            config.primary_port_name.clone(),
        ));
        let cache = InstanceCache::new(catalog.clone(), resolver, config.instance_interval());

        let services = catalog.service_ids().await.len();
        info!(
            services,
            refresh_secs = config.fetch_service_interval_seconds,
            "kubernetes discovery started"
        );

        Self {
            catalog,
            cache,
            refresh_task: Mutex::new(Some(refresh_task)),
        }
    }

    /// Ids of all currently known services (point-in-time copy)
    pub async fn services(&self) -> Vec<String> {
        self.catalog.service_ids().await
    }

    /// Current instances of a service.
    ///
    /// Empty for blank or unknown ids and for any recoverable upstream
    /// failure. The only error surfaced is the fatal configuration error for
    /// an unsatisfiable primary port name.
    pub async fn instances(
        &self,
        service_id: &str,
    ) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        self.cache.get(service_id).await
    }

    /// Subscribe to topology change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ServicesUpdate> {
        self.catalog.subscribe()
    }

    /// Fixed diagnostic description of this client
    pub fn description(&self) -> &'static str {
        "Kubernetes Discovery Client"
    }

    /// Stop the background catalog refresh. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.refresh_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
                info!("kubernetes discovery stopped");
            }
        }
    }
}

impl Drop for KubernetesDiscovery {
    fn drop(&mut self) {
        self.shutdown();
    }
}
