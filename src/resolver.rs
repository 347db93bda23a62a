//! Endpoint resolution: descriptor to live network instances.
//!
//! Given a cataloged service descriptor, the resolver fetches the endpoints
//! object from the owning namespace's client and fans it out into one
//! instance per ready address, with one port per subset chosen by the
//! port-selection policy.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{EndpointPort, EndpointSubset, Endpoints};
use tracing::{debug, warn};

use crate::catalog::ServiceDescriptor;
use crate::client::ClientRegistry;
use crate::error::DiscoveryError;

/// One live network endpoint of a service.
///
/// Immutable once built. `metadata` merges the endpoints object's labels and
/// annotations, annotations winning on key collision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Id of the service this instance belongs to
    pub service_id: String,
    /// Pod-level IP address
    pub host: String,
    /// Selected port
    pub port: i32,
    /// Namespace owning the backing endpoints object
    pub namespace: String,
    /// Labels and annotations of the endpoints object
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Instance identity within its service, `host-port`
    pub fn instance_id(&self) -> String {
        format!("{}-{}", self.host, self.port)
    }

    /// URI scheme; instances are plain HTTP
    pub fn scheme(&self) -> &'static str {
        "http"
    }

    /// Whether the instance speaks TLS; never the case for pod endpoints
    pub fn is_secure(&self) -> bool {
        false
    }

    /// Full address, `http://host:port`
    pub fn uri(&self) -> String {
        format!("{}://{}:{}", self.scheme(), self.host, self.port)
    }
}

/// Resolves a service descriptor to its current instances
pub struct EndpointResolver {
    registry: Arc<ClientRegistry>,
    /// Preferred port name for multi-port subsets; empty means "any port"
    primary_port_name: String,
}

impl EndpointResolver {
    /// Create a resolver routing through the given registry
    pub fn new(registry: Arc<ClientRegistry>, primary_port_name: String) -> Self {
        Self {
            registry,
            primary_port_name,
        }
    }

    /// Fetch and fan out the instances of one service.
    ///
    /// A missing client or endpoints object is not an error: it resolves to
    /// an empty list with a warning. Upstream API failures propagate as
    /// recoverable errors for the caller to absorb; an unsatisfiable port
    /// filter propagates as a fatal configuration error.
    pub async fn resolve(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        let service_id = &descriptor.id;
        debug!(service_id = %service_id, "fetching instances from kubernetes");

        let Some(client) = self.registry.client_for(&descriptor.namespace) else {
            warn!(namespace = %descriptor.namespace, "no client for namespace");
            return Ok(Vec::new());
        };

        let Some(endpoints) = client
            .get_endpoints(&descriptor.namespace, &descriptor.name)
            .await?
        else {
            warn!(service_id = %service_id, "no endpoints found");
            return Ok(Vec::new());
        };

        let metadata = instance_metadata(&endpoints);
        let mut instances = Vec::new();
        for subset in endpoints.subsets.unwrap_or_default() {
            let port = self.select_port(service_id, &subset)?;
            for address in subset.addresses.unwrap_or_default() {
                instances.push(ServiceInstance {
                    service_id: service_id.clone(),
                    host: address.ip,
                    port: port.port,
                    namespace: descriptor.namespace.clone(),
                    metadata: metadata.clone(),
                });
            }
        }
        Ok(instances)
    }

    /// Pick the one port to expose for a subset.
    ///
    /// A single port is always used as-is, ignoring any configured name
    /// filter. With more than one port, a configured primary port name
    /// selects the first case-insensitive match and a miss is a fatal
    /// configuration error; without a configured name, the first port in
    /// iteration order is used so tests stay reproducible.
    fn select_port(
        &self,
        service_id: &str,
        subset: &EndpointSubset,
    ) -> Result<EndpointPort, DiscoveryError> {
        let ports = subset.ports.as_deref().unwrap_or_default();
        if let [port] = ports {
            return Ok(port.clone());
        }

        let selected = if self.primary_port_name.is_empty() {
            ports.first()
        } else {
            ports.iter().find(|port| {
                port.name
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(&self.primary_port_name))
            })
        };
        selected.cloned().ok_or_else(|| {
            DiscoveryError::configuration(format!(
                "no port matching '{}' on endpoint subset of service '{}'",
                self.primary_port_name, service_id
            ))
        })
    }
}

/// Merge the endpoints object's labels and annotations into one map
fn instance_metadata(endpoints: &Endpoints) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(labels) = endpoints.metadata.labels.as_ref() {
        metadata.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if let Some(annotations) = endpoints.metadata.annotations.as_ref() {
        metadata.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    metadata
}
