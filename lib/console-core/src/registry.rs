//! Cluster registry: the live table of connection bundles

use crate::{ClusterError, ConnectionBundle, Result};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Returned by [`ClusterRegistry::add`] when the name is taken
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cluster already registered: {0}")]
pub struct AlreadyExists(pub String);

/// ClusterRegistry maps cluster names to fully built connection bundles
///
/// Bundles are inserted behind an `Arc`, so a reader holding a bundle keeps
/// using it even after it is replaced or removed, and never sees a partially
/// built one. Cloning the registry shares the same table.
#[derive(Clone, Default)]
pub struct ClusterRegistry {
    clusters: Arc<RwLock<HashMap<String, Arc<ConnectionBundle>>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cluster
    pub async fn get(&self, name: &str) -> Option<Arc<ConnectionBundle>> {
        let clusters = self.clusters.read().await;
        clusters.get(name).cloned()
    }

    /// Look up a cluster that callers expect to exist
    pub async fn use_cluster(&self, name: &str) -> Result<Arc<ConnectionBundle>> {
        self.get(name)
            .await
            .ok_or_else(|| ClusterError::ClusterNotFound(name.to_string()))
    }

    /// Register a new cluster
    pub async fn add(
        &self,
        name: &str,
        bundle: ConnectionBundle,
    ) -> std::result::Result<Arc<ConnectionBundle>, AlreadyExists> {
        let mut clusters = self.clusters.write().await;
        if clusters.contains_key(name) {
            return Err(AlreadyExists(name.to_string()));
        }
        let bundle = Arc::new(bundle);
        clusters.insert(name.to_string(), bundle.clone());
        debug!("Registered cluster: {}", name);
        Ok(bundle)
    }

    /// Replace the bundle of a cluster unconditionally
    pub async fn update(&self, name: &str, bundle: ConnectionBundle) -> Arc<ConnectionBundle> {
        let bundle = Arc::new(bundle);
        let mut clusters = self.clusters.write().await;
        clusters.insert(name.to_string(), bundle.clone());
        debug!("Replaced bundle for cluster: {}", name);
        bundle
    }

    /// Deregister a cluster
    pub async fn remove(&self, name: &str) -> Option<Arc<ConnectionBundle>> {
        let mut clusters = self.clusters.write().await;
        let removed = clusters.remove(name);
        if removed.is_some() {
            debug!("Deregistered cluster: {}", name);
        }
        removed
    }

    /// Names of all registered clusters, sorted
    pub async fn list_names(&self) -> Vec<String> {
        let clusters = self.clusters.read().await;
        let mut names: Vec<String> = clusters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of all registered clusters, sorted by name
    pub async fn list(&self) -> Vec<(String, Arc<ConnectionBundle>)> {
        let clusters = self.clusters.read().await;
        let mut entries: Vec<_> = clusters
            .iter()
            .map(|(name, bundle)| (name.clone(), bundle.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Whether mutation and deletion of `name` must be refused
    pub async fn is_static(&self, name: &str) -> bool {
        let clusters = self.clusters.read().await;
        clusters.get(name).map(|bundle| bundle.is_static()).unwrap_or(false)
    }

    /// Number of registered clusters
    pub async fn cluster_count(&self) -> usize {
        let clusters = self.clusters.read().await;
        clusters.len()
    }
}
