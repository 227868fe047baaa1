//! Durable storage of dynamic cluster records

use async_trait::async_trait;
use console_api::ConnectionParameters;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Durable counterpart of a dynamic cluster's connection parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedClusterRecord {
    pub cluster_name: String,
    pub params: ConnectionParameters,
}

impl PersistedClusterRecord {
    pub fn new(cluster_name: impl Into<String>, params: ConnectionParameters) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            params,
        }
    }
}

/// Opaque failure of the cluster store
#[derive(Error, Debug)]
#[error("{message}")]
pub struct StoreError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Persistence adapter for dynamic clusters, keyed by unique cluster name
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<PersistedClusterRecord>, StoreError>;

    /// Fails when the name is already taken
    async fn create(&self, record: &PersistedClusterRecord) -> Result<(), StoreError>;

    /// Fails when no record has the name
    async fn update(&self, record: &PersistedClusterRecord) -> Result<(), StoreError>;

    /// Move a record to a new unique name; a missing record is not an error
    async fn rename(&self, name: &str, new_name: &str) -> Result<(), StoreError>;

    /// Delete by name; a missing record is not an error
    async fn delete_by_name(&self, name: &str) -> Result<(), StoreError>;
}

/// In-memory cluster store for development and tests
#[derive(Clone, Default)]
pub struct MemoryClusterStore {
    records: Arc<RwLock<BTreeMap<String, ConnectionParameters>>>,
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.records.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn find_all(&self) -> Result<Vec<PersistedClusterRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .map(|(name, params)| PersistedClusterRecord::new(name.clone(), params.clone()))
            .collect())
    }

    async fn create(&self, record: &PersistedClusterRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.cluster_name) {
            return Err(StoreError::new(format!(
                "duplicate cluster name: {}",
                record.cluster_name
            )));
        }
        records.insert(record.cluster_name.clone(), record.params.clone());
        Ok(())
    }

    async fn update(&self, record: &PersistedClusterRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.cluster_name) {
            Some(params) => {
                *params = record.params.clone();
                Ok(())
            }
            None => Err(StoreError::new(format!(
                "no cluster record named {}",
                record.cluster_name
            ))),
        }
    }

    async fn rename(&self, name: &str, new_name: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(new_name) {
            return Err(StoreError::new(format!("duplicate cluster name: {new_name}")));
        }
        if let Some(params) = records.remove(name) {
            records.insert(new_name.to_string(), params);
        }
        Ok(())
    }

    async fn delete_by_name(&self, name: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(name);
        Ok(())
    }
}
