//! Per-namespace Kubernetes client management.
//!
//! Every configured namespace gets its own API client, built from the
//! connection parameters of the cluster that declares it. The registry is
//! immutable after construction: clients live as long as the process and are
//! looked up by namespace when resolving endpoints.
//!
//! The [`ClusterApi`] trait is the seam to the Kubernetes API. Production
//! uses [`KubeClusterApi`] backed by `kube::Client`; tests mock the trait to
//! exercise the discovery engine without a cluster.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::error::DiscoveryError;

/// Kubernetes API operations needed by the discovery engine.
///
/// One implementation exists per namespace; both calls are scoped to it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List all service objects in the namespace
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, DiscoveryError>;

    /// Fetch the endpoints object for a named service, if one exists
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, DiscoveryError>;
}

/// [`ClusterApi`] implementation backed by a real `kube::Client`
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>, DiscoveryError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, DiscoveryError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Registry of one API client per configured namespace.
///
/// Built once from the ordered cluster configuration. Namespaces must be
/// unique across all clusters; on a duplicate the first occurrence wins and
/// later ones are logged and skipped. Iteration follows configuration order,
/// which makes the catalog's first-writer-wins deduplication deterministic.
pub struct ClientRegistry {
    /// Namespaces in configuration order
    namespaces: Vec<String>,
    clients: HashMap<String, Arc<dyn ClusterApi>>,
}

impl ClientRegistry {
    /// Build the registry from cluster configuration, creating one
    /// `kube::Client` per namespace.
    ///
    /// Fails only on unusable connection parameters; an unreachable API
    /// server surfaces later, per call, as an empty scan result.
    pub async fn from_config(clusters: &[ClusterConfig]) -> Result<Self, DiscoveryError> {
        let mut pairs = Vec::new();
        for cluster in clusters {
            for namespace in &cluster.include_namespaces {
                let client = build_client(cluster, namespace).await?;
                pairs.push((
                    namespace.clone(),
                    Arc::new(KubeClusterApi::new(client)) as Arc<dyn ClusterApi>,
                ));
            }
        }
        Ok(Self::from_clients(pairs))
    }

    /// Build the registry from pre-constructed clients.
    ///
    /// Applies the duplicate-namespace rule: first occurrence wins.
    pub fn from_clients(
        clients: impl IntoIterator<Item = (String, Arc<dyn ClusterApi>)>,
    ) -> Self {
        let mut namespaces = Vec::new();
        let mut by_namespace: HashMap<String, Arc<dyn ClusterApi>> = HashMap::new();
        for (namespace, client) in clients {
            if by_namespace.contains_key(&namespace) {
                warn!(namespace = %namespace, "duplicate namespace in configuration, keeping first");
                continue;
            }
            namespaces.push(namespace.clone());
            by_namespace.insert(namespace, client);
        }
        Self {
            namespaces,
            clients: by_namespace,
        }
    }

    /// Client serving the given namespace, if one is configured
    pub fn client_for(&self, namespace: &str) -> Option<Arc<dyn ClusterApi>> {
        self.clients.get(namespace).cloned()
    }

    /// All `(namespace, client)` pairs in configuration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ClusterApi>)> {
        self.namespaces.iter().filter_map(|ns| {
            self.clients
                .get(ns)
                .map(|client| (ns.as_str(), client))
        })
    }

    /// Number of configured namespaces
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// Whether no namespaces are configured
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

/// Create a `kube::Client` for one namespace of a cluster.
///
/// The connection parameters are assembled into an in-memory kubeconfig and
/// loaded through the standard config machinery, so CA files and tokens get
/// the same treatment as any other kubeconfig.
async fn build_client(cluster: &ClusterConfig, namespace: &str) -> Result<Client, DiscoveryError> {
    debug!(namespace = %namespace, server = %cluster.api_server_url, "creating kubernetes client");

    let context = format!("discovery-{namespace}");
    let kubeconfig: Kubeconfig = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": &context,
            "cluster": {
                "server": &cluster.api_server_url,
                "certificate-authority": &cluster.ca_cert_file,
                "insecure-skip-tls-verify": cluster.insecure_skip_tls_verify,
            },
        }],
        "users": [{
            "name": &context,
            "user": { "token": &cluster.token },
        }],
        "contexts": [{
            "name": &context,
            "context": {
                "cluster": &context,
                "user": &context,
                "namespace": namespace,
            },
        }],
        "current-context": &context,
    }))
    .map_err(|e| DiscoveryError::configuration(format!("invalid cluster config: {e}")))?;

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            DiscoveryError::configuration(format!(
                "failed to build client config for namespace '{namespace}': {e}"
            ))
        })?;

    Ok(Client::try_from(config)?)
}
