//! Console API types shared by the cluster core, the store and the server
//!
//! This library defines:
//! - ConnectionParameters: how to reach one Kubernetes API server
//! - ClusterCreate: the admin request body for adding or updating a cluster
//! - ClusterInfo: the read model returned for registered clusters
//! - DataSelectQuery and Page: filter/paginate inputs and outputs for list calls

pub mod v1;

pub use v1::{
    validate_cluster_name, ClusterCreate, ClusterInfo, ConnectionParameters, DataSelectQuery, Page,
    TlsClientConfig, ValidationError,
};
