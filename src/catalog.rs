//! Service catalog: periodic enumeration of discoverable services.
//!
//! The catalog scans every configured namespace on a fixed period, validates
//! and deduplicates the service objects it finds, and publishes the result as
//! an immutable snapshot. Readers always see a complete snapshot; the refresh
//! task is the only writer and replaces the whole map atomically.
//!
//! A service is discoverable when it carries a label whose key contains the
//! substring `serviceId` (substring match, anywhere in the key) with a
//! non-empty value. That value becomes the service id and must be unique
//! across the whole scanned topology; on a collision the first-enumerated
//! service wins.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::ClientRegistry;

/// Label that opts a service out of discovery when set to `true`
const LABEL_DISABLED: &str = "discovery.disabled";
/// Substring a label key must contain to designate the service id
const SERVICE_ID_KEY: &str = "serviceId";

/// Validated record identifying one discoverable service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Topology-wide unique id, taken from the `serviceId` label value
    pub id: String,
    /// Kubernetes service name, unique per namespace
    pub name: String,
    /// Namespace owning the service
    pub namespace: String,
}

impl ServiceDescriptor {
    /// Validate a raw service object into a descriptor.
    ///
    /// Returns `None` when the object is not discoverable: missing name or
    /// namespace, no labels, disabled via `discovery.disabled=true`, or no
    /// `serviceId` label with a non-empty value. Invalid objects are dropped
    /// at debug level and never abort a scan.
    pub fn from_service(service: &Service) -> Option<Self> {
        let metadata = &service.metadata;
        let name = match metadata.name.as_deref() {
            Some(name) => name,
            None => {
                debug!("skipping service without a name");
                return None;
            }
        };
        let namespace = match metadata.namespace.as_deref() {
            Some(namespace) => namespace,
            None => {
                debug!(service = %name, "skipping service without a namespace");
                return None;
            }
        };
        let labels = match metadata.labels.as_ref() {
            Some(labels) if !labels.is_empty() => labels,
            _ => {
                debug!(service = %name, "skipping service without labels");
                return None;
            }
        };

        if labels
            .get(LABEL_DISABLED)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            debug!(service = %name, "skipping disabled service");
            return None;
        }

        // First label key containing the marker, in label iteration order.
        let id = labels
            .iter()
            .find(|(key, value)| key.contains(SERVICE_ID_KEY) && !value.is_empty())
            .map(|(_, value)| value.clone());
        match id {
            Some(id) => Some(Self {
                id,
                name: name.to_string(),
                namespace: namespace.to_string(),
            }),
            None => {
                debug!(service = %name, "skipping service without a serviceId label");
                None
            }
        }
    }
}

/// Point-in-time view of the discoverable topology, keyed by service id
pub type CatalogSnapshot = HashMap<String, ServiceDescriptor>;

/// Notification that the set of discoverable services changed.
///
/// Carries the full new id set so subscribers can diff against their own
/// state instead of re-querying the catalog.
#[derive(Debug, Clone)]
pub struct ServicesUpdate {
    /// All service ids in the new snapshot
    pub services: HashSet<String>,
}

/// Periodically refreshed catalog of discoverable services.
///
/// Construct with [`ServiceCatalog::new`], which runs one scan synchronously
/// so the catalog is populated before the first query, then call
/// [`ServiceCatalog::start`] to schedule periodic refreshes.
pub struct ServiceCatalog {
    registry: Arc<ClientRegistry>,
    exclude: HashSet<String>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    updates: broadcast::Sender<ServicesUpdate>,
    scanned_once: AtomicBool,
}

impl ServiceCatalog {
    /// Create the catalog and run the initial scan.
    pub async fn new(registry: Arc<ClientRegistry>, exclude: HashSet<String>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(16);
        let catalog = Arc::new(Self {
            registry,
            exclude,
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::new())),
            updates,
            scanned_once: AtomicBool::new(false),
        });
        catalog.refresh().await;
        catalog
    }

    /// Spawn the periodic refresh task.
    ///
    /// The returned handle is the teardown point: aborting it stops all
    /// future scans. Refresh failures never stop the schedule; a failed scan
    /// is simply superseded by the next cycle.
    pub fn start(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let catalog = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; the constructor already scanned.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                catalog.refresh().await;
            }
        })
    }

    /// Scan all namespaces and atomically publish a new snapshot.
    ///
    /// Emits a [`ServicesUpdate`] when the snapshot size changed (the initial
    /// scan always emits). Same-size membership churn is not detected; this
    /// is a known limitation of the size-based change check.
    pub async fn refresh(&self) {
        debug!("fetching services from kubernetes");

        let mut next = CatalogSnapshot::new();
        for (namespace, client) in self.registry.iter() {
            let services = match client.list_services(namespace).await {
                Ok(services) => services,
                Err(e) => {
                    // Treated as an empty namespace for this cycle only.
                    warn!(namespace = %namespace, error = %e, "service scan failed");
                    continue;
                }
            };
            for service in &services {
                let Some(descriptor) = ServiceDescriptor::from_service(service) else {
                    continue;
                };
                if let Some(winner) = next.get(&descriptor.id) {
                    debug!(
                        service_id = %descriptor.id,
                        loser = %format!("{}/{}", descriptor.namespace, descriptor.name),
                        winner = %format!("{}/{}", winner.namespace, winner.name),
                        "duplicate service id, keeping first"
                    );
                    continue;
                }
                if self.exclude.contains(&descriptor.id) {
                    debug!(service_id = %descriptor.id, "service id is excluded");
                    continue;
                }
                next.insert(descriptor.id.clone(), descriptor);
            }
        }

        debug!(services = next.len(), "catalog scan complete");

        let next = Arc::new(next);
        let previous_len = {
            let mut guard = self.snapshot.write().await;
            std::mem::replace(&mut *guard, next.clone()).len()
        };

        let first_scan = !self.scanned_once.swap(true, Ordering::SeqCst);
        if first_scan || previous_len != next.len() {
            let update = ServicesUpdate {
                services: next.keys().cloned().collect(),
            };
            // No receivers is fine; subscribers may come and go.
            let _ = self.updates.send(update);
        }
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Descriptor for a service id, if currently cataloged
    pub async fn lookup(&self, service_id: &str) -> Option<ServiceDescriptor> {
        self.snapshot.read().await.get(service_id).cloned()
    }

    /// All currently cataloged service ids (point-in-time copy)
    pub async fn service_ids(&self) -> Vec<String> {
        self.snapshot.read().await.keys().cloned().collect()
    }

    /// Subscribe to topology change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ServicesUpdate> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::client::MockClusterApi;
    use crate::error::DiscoveryError;

    fn service(name: &str, namespace: &str, labels: &[(&str, &str)]) -> Service {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: (!labels.is_empty()).then_some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn registry_with(namespace: &str, services: Vec<Service>) -> Arc<ClientRegistry> {
        let mut mock = MockClusterApi::new();
        mock.expect_list_services()
            .returning(move |_| Ok(services.clone()));
        Arc::new(ClientRegistry::from_clients(vec![(
            namespace.to_string(),
            Arc::new(mock) as _,
        )]))
    }

    #[test]
    fn descriptor_from_labeled_service() {
        let svc = service("orders", "ns1", &[("app.serviceId", "orders-svc")]);
        let descriptor = ServiceDescriptor::from_service(&svc).unwrap();
        assert_eq!(descriptor.id, "orders-svc");
        assert_eq!(descriptor.name, "orders");
        assert_eq!(descriptor.namespace, "ns1");
    }

    #[test]
    fn descriptor_requires_labels() {
        let svc = service("orders", "ns1", &[]);
        assert!(ServiceDescriptor::from_service(&svc).is_none());
    }

    #[test]
    fn descriptor_requires_service_id_label() {
        let svc = service("orders", "ns1", &[("app", "orders")]);
        assert!(ServiceDescriptor::from_service(&svc).is_none());

        let svc = service("orders", "ns1", &[("app.serviceId", "")]);
        assert!(ServiceDescriptor::from_service(&svc).is_none());
    }

    #[test]
    fn descriptor_rejects_disabled_service() {
        let svc = service(
            "orders",
            "ns1",
            &[("app.serviceId", "orders-svc"), ("discovery.disabled", "true")],
        );
        assert!(ServiceDescriptor::from_service(&svc).is_none());

        // Only a literal true disables; other values do not.
        let svc = service(
            "orders",
            "ns1",
            &[("app.serviceId", "orders-svc"), ("discovery.disabled", "false")],
        );
        assert!(ServiceDescriptor::from_service(&svc).is_some());
    }

    #[test]
    fn descriptor_requires_name() {
        let svc = Service {
            metadata: ObjectMeta {
                namespace: Some("ns1".to_string()),
                labels: Some([("serviceId".to_string(), "x".to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ServiceDescriptor::from_service(&svc).is_none());
    }

    #[tokio::test]
    async fn catalog_holds_all_valid_unique_ids() {
        let registry = registry_with(
            "ns1",
            vec![
                service("orders", "ns1", &[("app.serviceId", "orders-svc")]),
                service("billing", "ns1", &[("serviceId", "billing-svc")]),
                service("unlabeled", "ns1", &[("app", "x")]),
            ],
        );
        let catalog = ServiceCatalog::new(registry, HashSet::new()).await;

        let mut ids = catalog.service_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["billing-svc", "orders-svc"]);
    }

    #[tokio::test]
    async fn duplicate_id_keeps_first_enumerated() {
        let registry = registry_with(
            "ns1",
            vec![
                service("orders-a", "ns1", &[("app.serviceId", "orders-svc")]),
                service("orders-b", "ns1", &[("app.serviceId", "orders-svc")]),
            ],
        );
        let catalog = ServiceCatalog::new(registry, HashSet::new()).await;

        let snapshot = catalog.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("orders-svc").unwrap().name, "orders-a");
    }

    #[tokio::test]
    async fn excluded_id_never_enters_catalog() {
        let registry = registry_with(
            "ns1",
            vec![service("orders", "ns1", &[("app.serviceId", "orders-svc")])],
        );
        let exclude: HashSet<String> = ["orders-svc".to_string()].into();
        let catalog = ServiceCatalog::new(registry, exclude).await;

        assert!(catalog.service_ids().await.is_empty());
    }

    #[tokio::test]
    async fn failed_scan_keeps_other_namespaces() {
        let mut failing = MockClusterApi::new();
        failing
            .expect_list_services()
            .returning(|_| Err(DiscoveryError::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the server is currently unable to handle the request".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        }))));

        let mut healthy = MockClusterApi::new();
        healthy.expect_list_services().returning(|_| {
            Ok(vec![service("orders", "ns2", &[("serviceId", "orders-svc")])])
        });

        let registry = Arc::new(ClientRegistry::from_clients(vec![
            ("ns1".to_string(), Arc::new(failing) as _),
            ("ns2".to_string(), Arc::new(healthy) as _),
        ]));
        let catalog = ServiceCatalog::new(registry, HashSet::new()).await;

        assert_eq!(catalog.service_ids().await, vec!["orders-svc"]);
    }

    #[tokio::test]
    async fn initial_scan_notifies_subscribers() {
        let registry = registry_with(
            "ns1",
            vec![service("orders", "ns1", &[("serviceId", "orders-svc")])],
        );

        // Subscribe before the initial scan by constructing by hand.
        let (updates, mut rx) = broadcast::channel(16);
        let catalog = ServiceCatalog {
            registry,
            exclude: HashSet::new(),
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::new())),
            updates,
            scanned_once: AtomicBool::new(false),
        };
        catalog.refresh().await;

        let update = rx.try_recv().unwrap();
        assert_eq!(update.services, ["orders-svc".to_string()].into());
    }

    #[tokio::test]
    async fn size_change_emits_update_but_same_size_churn_does_not() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_in_mock = calls.clone();
        let mut mock = MockClusterApi::new();
        mock.expect_list_services().returning(move |_| {
            let call = calls_in_mock.fetch_add(1, Ordering::SeqCst);
            Ok(match call {
                // Same size, different membership: no notification.
                0 => vec![service("orders", "ns1", &[("serviceId", "orders-svc")])],
                1 => vec![service("billing", "ns1", &[("serviceId", "billing-svc")])],
                // Size change: notification.
                _ => vec![
                    service("orders", "ns1", &[("serviceId", "orders-svc")]),
                    service("billing", "ns1", &[("serviceId", "billing-svc")]),
                ],
            })
        });
        let registry = Arc::new(ClientRegistry::from_clients(vec![(
            "ns1".to_string(),
            Arc::new(mock) as _,
        )]));

        let catalog = ServiceCatalog::new(registry, HashSet::new()).await;
        let mut rx = catalog.subscribe();

        catalog.refresh().await; // same size
        assert!(rx.try_recv().is_err());

        catalog.refresh().await; // grew to two
        let update = rx.try_recv().unwrap();
        assert_eq!(update.services.len(), 2);
    }
}
