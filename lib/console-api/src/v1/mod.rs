/// API version v1 for console cluster types

pub mod cluster;
pub mod select;

pub use cluster::{
    validate_cluster_name, ClusterCreate, ClusterInfo, ConnectionParameters, TlsClientConfig,
    ValidationError,
};
pub use select::{DataSelectQuery, Page};

/// Maximum length of a cluster name
pub const MAX_CLUSTER_NAME_LEN: usize = 32;
