//! Cluster registry and resource selection for the operations console
//!
//! This library provides:
//! - Connection builder turning connection parameters into client bundles
//! - Discovery client with a disk cache and an in-memory fallback
//! - Cluster registry holding static and dynamic clusters
//! - Cluster lifecycle manager keeping the registry and the store consistent
//! - Background health refresher
//! - Generic filter/sort/paginate selector for Kubernetes lists
//! - Resource list/get/delete helpers routed through the selector

pub mod connection;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod refresher;
pub mod registry;
pub mod resources;
pub mod select;
pub mod static_clusters;
pub mod store;

pub use connection::{
    ClusterStatus, ConnectionBuilder, ConnectionBundle, ConnectionSettings, DynamicClient,
    STATUS_UNKNOWN,
};
pub use discovery::{CachedDiscovery, DiscoverySettings, DiscoveryStrategy};
pub use error::{ClusterError, ConnectError, DiscoveryError, Result};
pub use manager::ClusterManager;
pub use refresher::{refresh_cluster, ClusterRefresher, RefreshConfig, STATUS_HEALTHY};
pub use registry::ClusterRegistry;
pub use select::{select, Selectable};
pub use static_clusters::{StaticCluster, StaticClusterSources, IN_CLUSTER_NAME};
pub use store::{ClusterStore, MemoryClusterStore, PersistedClusterRecord, StoreError};
