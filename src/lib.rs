//! kube-discovery - In-process Kubernetes service discovery
//!
//! Mirrors the service topology of one or more Kubernetes clusters into an
//! in-memory, queryable registry, so applications can resolve logical service
//! ids to live `host:port` endpoints without a dedicated discovery server.
//!
//! # Architecture
//!
//! ```text
//! KubernetesDiscovery (query surface)
//!   ├── ServiceCatalog    periodic scan → validated, deduplicated snapshot
//!   │     └── ClientRegistry   one API client per configured namespace
//!   └── InstanceCache     refresh-ahead, single-flight per service id
//!         └── EndpointResolver  endpoints fetch + port-selection policy
//! ```
//!
//! Services opt in to discovery with a label whose key contains `serviceId`;
//! the label value becomes the topology-wide service id. The catalog is
//! rebuilt wholesale on a fixed period and published as an atomic snapshot;
//! instance lists are cached per service and refreshed behind reads once past
//! their freshness interval.
//!
//! # Modules
//!
//! - [`discovery`] - Public query surface and lifecycle
//! - [`catalog`] - Service enumeration, validation, snapshot publication
//! - [`cache`] - Refresh-ahead instance cache
//! - [`resolver`] - Endpoints fetch and port selection
//! - [`client`] - Per-namespace Kubernetes clients
//! - [`config`] - Host-supplied configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cache;
pub mod catalog;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod resolver;

pub use cache::InstanceCache;
pub use catalog::{CatalogSnapshot, ServiceCatalog, ServiceDescriptor, ServicesUpdate};
pub use client::{ClientRegistry, ClusterApi, KubeClusterApi};
pub use config::{ClusterConfig, DiscoveryConfig};
pub use discovery::KubernetesDiscovery;
pub use error::DiscoveryError;
pub use resolver::{EndpointResolver, ServiceInstance};
