use console_api::ValidationError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Failures reported by registry and lifecycle operations
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cluster {cluster} is unreachable: {source}")]
    ConnectionFailed {
        cluster: String,
        #[source]
        source: ConnectError,
    },

    #[error("cluster already exists: {0}")]
    ClusterExists(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("static cluster cannot be modified: {0}")]
    ImmutableCluster(String),

    #[error("failed to persist cluster {cluster}: {source}")]
    PersistenceFailed {
        cluster: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid cluster parameters: {0}")]
    InvalidParameters(#[from] ValidationError),

    #[error("failed to load persisted clusters: {0}")]
    Store(#[source] StoreError),

    #[error("in-cluster configuration unavailable: {0}")]
    InCluster(#[from] kube::config::InClusterError),

    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("request to cluster {cluster} timed out after {timeout:?}")]
    Timeout { cluster: String, timeout: Duration },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("cluster {cluster} does not serve {plural} in {group_version}")]
    UnknownResource {
        cluster: String,
        group_version: String,
        plural: String,
    },
}

/// Failures while building a connection bundle
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("invalid client configuration: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to load client configuration: {0}")]
    Config(#[from] kube::config::KubeconfigError),

    #[error("failed to create client: {0}")]
    Client(#[from] kube::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Failures of the discovery client
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("discovery cache unavailable at {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create discovery client: {0}")]
    Client(#[source] kube::Error),

    #[error("no discovery client available (disk cache: {disk}; memory cache: {memory})")]
    Unavailable {
        disk: Box<DiscoveryError>,
        memory: Box<DiscoveryError>,
    },

    #[error("discovery request failed: {0}")]
    Request(#[source] kube::Error),

    #[error("discovery request timed out after {0:?}")]
    Timeout(Duration),
}
