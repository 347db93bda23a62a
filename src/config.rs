//! Configuration for the discovery engine.
//!
//! The crate is a library: the host application deserializes these structs
//! from whatever configuration source it uses and passes them in. All fields
//! carry serde defaults so a minimal configuration only needs the cluster
//! connection parameters.

use std::time::Duration;

use serde::Deserialize;

/// Top-level discovery configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DiscoveryConfig {
    /// Port name preferred when an endpoint subset exposes more than one
    /// port. Matched case-insensitively. A configured name that matches no
    /// port on a multi-port subset is a fatal configuration error.
    pub primary_port_name: String,

    /// How often the service catalog is rescanned, in seconds
    pub fetch_service_interval_seconds: u64,

    /// Freshness interval for cached instance lists, in seconds. Reads past
    /// this interval return the previous value and refresh in the background.
    pub fetch_instance_interval_seconds: u64,

    /// Connection parameters for every cluster to scan, in priority order
    pub clusters: Vec<ClusterConfig>,

    /// Service ids that must never enter the catalog, even when otherwise
    /// valid and unique. Normally left empty; services opt out themselves
    /// with the `discovery.disabled=true` label.
    pub exclude_services: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            primary_port_name: "service-port".to_string(),
            fetch_service_interval_seconds: 30,
            fetch_instance_interval_seconds: 30,
            clusters: Vec::new(),
            exclude_services: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    /// Catalog rescan period
    pub fn service_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_service_interval_seconds)
    }

    /// Instance cache freshness interval
    pub fn instance_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_instance_interval_seconds)
    }
}

/// Connection parameters for one cluster
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// Kubernetes API server URL
    pub api_server_url: String,

    /// Path to the cluster CA certificate file
    pub ca_cert_file: Option<String>,

    /// Bearer token for API authentication
    pub token: Option<String>,

    /// Skip TLS certificate verification
    pub insecure_skip_tls_verify: bool,

    /// Namespaces to scan in this cluster, in priority order. Namespaces must
    /// be unique across the whole configuration; on a duplicate the first
    /// occurrence wins.
    pub include_namespaces: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_server_url: "https://kubernetes.default".to_string(),
            ca_cert_file: None,
            token: None,
            insecure_skip_tls_verify: false,
            include_namespaces: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.primary_port_name, "service-port");
        assert_eq!(config.service_interval(), Duration::from_secs(30));
        assert_eq!(config.instance_interval(), Duration::from_secs(30));
        assert!(config.clusters.is_empty());
        assert!(config.exclude_services.is_empty());
    }

    #[test]
    fn cluster_defaults_to_in_cluster_api_server() {
        let cluster = ClusterConfig::default();
        assert_eq!(cluster.api_server_url, "https://kubernetes.default");
        assert!(!cluster.insecure_skip_tls_verify);
    }

    #[test]
    fn deserializes_partial_configuration() {
        let json = r#"{
            "primary-port-name": "http",
            "clusters": [{"include-namespaces": ["ns1", "ns2"]}],
            "exclude-services": ["legacy-svc"]
        }"#;
        let config: DiscoveryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.primary_port_name, "http");
        assert_eq!(config.fetch_service_interval_seconds, 30);
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].include_namespaces, vec!["ns1", "ns2"]);
        assert_eq!(config.exclude_services, vec!["legacy-svc"]);
    }
}
