//! Cluster lifecycle: keeps the registry and the cluster store consistent

use console_api::{validate_cluster_name, ClusterCreate, ClusterInfo, ConnectionParameters};
use futures::future::join_all;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::refresher::refresh_cluster;
use crate::registry::AlreadyExists;
use crate::{
    ClusterError, ClusterRegistry, ClusterStore, ConnectionBuilder, ConnectionBundle,
    PersistedClusterRecord, Result, StaticClusterSources, StoreError,
};

const BACKUP_SUFFIX_LEN: usize = 6;

/// Administrative operations over static and dynamic clusters
///
/// Add, update and delete are serialized with each other. Reads go straight
/// to the registry and never wait on them.
pub struct ClusterManager {
    registry: ClusterRegistry,
    store: Arc<dyn ClusterStore>,
    builder: ConnectionBuilder,
    probe_timeout: Duration,
    admin: Mutex<()>,
}

impl ClusterManager {
    pub fn new(
        registry: ClusterRegistry,
        store: Arc<dyn ClusterStore>,
        builder: ConnectionBuilder,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            builder,
            probe_timeout,
            admin: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Load static clusters, then every persisted dynamic cluster.
    ///
    /// Any failure aborts the boot; the registry is left partially filled.
    pub async fn boot(&self, sources: &StaticClusterSources) -> Result<()> {
        let static_count = self.load_static(sources).await?;
        let dynamic_count = self.load_persisted().await?;
        info!(
            "Loaded {} static and {} dynamic clusters",
            static_count, dynamic_count
        );
        Ok(())
    }

    /// Register clusters from local configuration as immutable entries
    pub async fn load_static(&self, sources: &StaticClusterSources) -> Result<usize> {
        let clusters = sources.load().await?;
        let count = clusters.len();
        for cluster in clusters {
            let bundle = self
                .builder
                .build_static(cluster.config)
                .await
                .map_err(|source| ClusterError::ConnectionFailed {
                    cluster: cluster.name.clone(),
                    source,
                })?;
            self.registry
                .add(&cluster.name, bundle)
                .await
                .map_err(already_exists)?;
            info!(cluster = %cluster.name, "Registered static cluster");
        }
        Ok(count)
    }

    /// Register every record of the cluster store as a dynamic entry
    pub async fn load_persisted(&self) -> Result<usize> {
        let records = self.store.find_all().await.map_err(ClusterError::Store)?;
        let count = records.len();
        for record in records {
            record.params.validate()?;
            let bundle = self.connect(&record.cluster_name, &record.params).await?;
            self.registry
                .add(&record.cluster_name, bundle)
                .await
                .map_err(already_exists)?;
            info!(cluster = %record.cluster_name, "Registered persisted cluster");
        }
        Ok(count)
    }

    /// Add a dynamic cluster from an admin request; returns its name
    pub async fn create_cluster(&self, request: ClusterCreate) -> Result<String> {
        let (name, params) = request.into_parts()?;
        self.add_cluster(&name, params).await?;
        Ok(name)
    }

    /// Build, register, then persist a new dynamic cluster.
    ///
    /// The registry entry is removed again when the record cannot be stored.
    pub async fn add_cluster(&self, name: &str, params: ConnectionParameters) -> Result<()> {
        let _admin = self.admin.lock().await;

        let name = name.trim();
        validate_cluster_name(name)?;
        params.validate()?;
        if self.registry.get(name).await.is_some() {
            return Err(ClusterError::ClusterExists(name.to_string()));
        }

        let bundle = self.connect(name, &params).await?;
        self.registry.add(name, bundle).await.map_err(already_exists)?;

        let record = PersistedClusterRecord::new(name, params);
        if let Err(source) = self.store.create(&record).await {
            error!(cluster = %name, "Failed to persist cluster, rolling back: {}", source);
            self.registry.remove(name).await;
            return Err(ClusterError::PersistenceFailed {
                cluster: name.to_string(),
                source,
            });
        }

        info!(cluster = %name, "Added cluster {}", record.params.host);
        Ok(())
    }

    /// Replace the connection parameters of a dynamic cluster.
    ///
    /// The record is written before the live bundle is swapped, so a store
    /// failure leaves the old bundle serving.
    pub async fn update_cluster(&self, name: &str, params: ConnectionParameters) -> Result<()> {
        let _admin = self.admin.lock().await;

        let current = self.registry.use_cluster(name).await?;
        if current.is_static() {
            return Err(ClusterError::ImmutableCluster(name.to_string()));
        }
        params.validate()?;

        let bundle = self.connect(name, &params).await?;
        let record = PersistedClusterRecord::new(name, params);
        self.store.update(&record).await.map_err(|source| {
            error!(cluster = %name, "Failed to persist cluster update: {}", source);
            ClusterError::PersistenceFailed {
                cluster: name.to_string(),
                source,
            }
        })?;

        self.registry.update(name, bundle).await;
        info!(cluster = %name, "Updated cluster {}", record.params.host);
        Ok(())
    }

    /// Remove a dynamic cluster from the store, then from the registry.
    ///
    /// The record is first moved to a random backup name so the original name
    /// is free for a new cluster before the row is gone.
    pub async fn delete_cluster(&self, name: &str) -> Result<()> {
        let _admin = self.admin.lock().await;

        let current = self.registry.use_cluster(name).await?;
        if current.is_static() {
            return Err(ClusterError::ImmutableCluster(name.to_string()));
        }

        let backup = backup_name(name);
        let persistence_failed = |source: StoreError| {
            error!(cluster = %name, "Failed to delete cluster record: {}", source);
            ClusterError::PersistenceFailed {
                cluster: name.to_string(),
                source,
            }
        };
        self.store.rename(name, &backup).await.map_err(persistence_failed)?;
        self.store.delete_by_name(&backup).await.map_err(persistence_failed)?;

        self.registry.remove(name).await;
        info!(cluster = %name, "Deleted cluster");
        Ok(())
    }

    /// Read model of one cluster, probing it first when `force` is set
    pub async fn cluster_info(&self, name: &str, force: bool) -> Result<ClusterInfo> {
        let bundle = self.registry.use_cluster(name).await?;
        if force {
            refresh_cluster(&bundle, self.probe_timeout).await;
        }
        Ok(snapshot(name, &bundle).await)
    }

    /// Read models of every cluster, sorted by name
    pub async fn cluster_infos(&self, force: bool) -> Vec<ClusterInfo> {
        let clusters = self.registry.list().await;
        if force {
            join_all(
                clusters
                    .iter()
                    .map(|(_, bundle)| refresh_cluster(bundle, self.probe_timeout)),
            )
            .await;
        }
        join_all(clusters.iter().map(|(name, bundle)| snapshot(name, bundle))).await
    }

    async fn connect(&self, name: &str, params: &ConnectionParameters) -> Result<ConnectionBundle> {
        self.builder.build(params).await.map_err(|source| {
            error!(cluster = %name, "Failed to connect to {}: {}", params.host, source);
            ClusterError::ConnectionFailed {
                cluster: name.to_string(),
                source,
            }
        })
    }
}

async fn snapshot(name: &str, bundle: &ConnectionBundle) -> ClusterInfo {
    let status = bundle.status().await;
    ClusterInfo {
        cluster_name: name.to_string(),
        host: bundle.params().host.clone(),
        insecure: bundle.params().tls_insecure,
        is_static: bundle.is_static(),
        version: status.version.clone(),
        status: status.status.clone(),
        node_count: status.node_count,
        created_at: bundle.created_at(),
        last_refreshed: status.last_refreshed,
    }
}

fn already_exists(AlreadyExists(name): AlreadyExists) -> ClusterError {
    ClusterError::ClusterExists(name)
}

/// Temporary unique name a record is moved to before deletion
fn backup_name(name: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(BACKUP_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{name}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{test_builder, token_params};
    use crate::connection::STATUS_UNKNOWN;
    use crate::MemoryClusterStore;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: https://127.0.0.1:6443
    insecure-skip-tls-verify: true
users:
- name: admin
  user:
    token: local-token
contexts:
- name: local
  context:
    cluster: local
    user: admin
"#;

    // Well-formed PEM whose payload is not a DER certificate, so it passes
    // validation and fails when the TLS client is built.
    const UNPARSABLE_CA: &str = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";

    fn unbuildable_params() -> ConnectionParameters {
        ConnectionParameters::new("https://127.0.0.1:6443")
            .with_bearer_token("test-token")
            .with_ca(UNPARSABLE_CA)
    }

    /// Memory store whose writes can be made to fail
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryClusterStore,
        fail_find: AtomicBool,
        fail_create: AtomicBool,
        fail_update: AtomicBool,
        fail_delete: AtomicBool,
    }

    impl FlakyStore {
        fn check(flag: &AtomicBool, op: &str) -> std::result::Result<(), StoreError> {
            if flag.load(Ordering::SeqCst) {
                Err(StoreError::new(format!("injected {op} failure")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ClusterStore for FlakyStore {
        async fn find_all(&self) -> std::result::Result<Vec<PersistedClusterRecord>, StoreError> {
            Self::check(&self.fail_find, "find")?;
            self.inner.find_all().await
        }

        async fn create(&self, record: &PersistedClusterRecord) -> std::result::Result<(), StoreError> {
            Self::check(&self.fail_create, "create")?;
            self.inner.create(record).await
        }

        async fn update(&self, record: &PersistedClusterRecord) -> std::result::Result<(), StoreError> {
            Self::check(&self.fail_update, "update")?;
            self.inner.update(record).await
        }

        async fn rename(&self, name: &str, new_name: &str) -> std::result::Result<(), StoreError> {
            self.inner.rename(name, new_name).await
        }

        async fn delete_by_name(&self, name: &str) -> std::result::Result<(), StoreError> {
            Self::check(&self.fail_delete, "delete")?;
            self.inner.delete_by_name(name).await
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<FlakyStore>,
        manager: ClusterManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::default());
        let manager = ClusterManager::new(
            ClusterRegistry::new(),
            store.clone(),
            test_builder(dir.path()),
            Duration::from_secs(2),
        );
        Fixture {
            _dir: dir,
            store,
            manager,
        }
    }

    async fn with_static_cluster(fixture: &Fixture) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KUBECONFIG.as_bytes()).unwrap();
        let sources = StaticClusterSources {
            in_cluster: false,
            kubeconfig: Some(file.path().to_path_buf()),
        };
        assert_eq!(fixture.manager.load_static(&sources).await.unwrap(), 1);
        file
    }

    #[tokio::test]
    async fn test_add_registers_and_persists() {
        let fx = fixture();
        fx.manager
            .add_cluster("prod", token_params("https://127.0.0.1:6443"))
            .await
            .unwrap();

        let bundle = fx.manager.registry().get("prod").await.unwrap();
        assert!(!bundle.is_static());
        assert_eq!(fx.store.inner.names().await, vec!["prod"]);
    }

    #[tokio::test]
    async fn test_add_rejects_existing_name() {
        let fx = fixture();
        let params = token_params("https://127.0.0.1:6443");
        fx.manager.add_cluster("prod", params.clone()).await.unwrap();

        assert!(matches!(
            fx.manager.add_cluster("prod", params).await,
            Err(ClusterError::ClusterExists(name)) if name == "prod"
        ));
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_parameters() {
        let fx = fixture();
        let params = ConnectionParameters::new("https://127.0.0.1:6443").with_bearer_token("t");

        assert!(matches!(
            fx.manager.add_cluster("prod", params).await,
            Err(ClusterError::InvalidParameters(_))
        ));
        assert!(matches!(
            fx.manager.add_cluster("", token_params("https://127.0.0.1:6443")).await,
            Err(ClusterError::InvalidParameters(_))
        ));
        assert_eq!(fx.manager.registry().cluster_count().await, 0);
    }

    #[tokio::test]
    async fn test_add_trims_name() {
        let fx = fixture();
        fx.manager
            .add_cluster("  prod  ", token_params("https://127.0.0.1:6443"))
            .await
            .unwrap();

        assert!(fx.manager.registry().get("prod").await.is_some());
        assert_eq!(fx.store.inner.names().await, vec!["prod"]);
        assert!(matches!(
            fx.manager.add_cluster("prod ", token_params("https://127.0.0.2:6443")).await,
            Err(ClusterError::ClusterExists(name)) if name == "prod"
        ));
    }

    #[tokio::test]
    async fn test_add_leaves_nothing_behind_when_build_fails() {
        let fx = fixture();
        let params = unbuildable_params();
        assert_eq!(params.validate(), Ok(()));

        assert!(matches!(
            fx.manager.add_cluster("prod", params).await,
            Err(ClusterError::ConnectionFailed { cluster, .. }) if cluster == "prod"
        ));
        assert_eq!(fx.manager.registry().cluster_count().await, 0);
        assert!(fx.store.inner.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_old_bundle_and_record_when_build_fails() {
        let fx = fixture();
        fx.manager
            .add_cluster("prod", token_params("https://127.0.0.1:6443"))
            .await
            .unwrap();
        let before = fx.manager.registry().get("prod").await.unwrap();

        assert!(matches!(
            fx.manager.update_cluster("prod", unbuildable_params()).await,
            Err(ClusterError::ConnectionFailed { .. })
        ));

        let after = fx.manager.registry().get("prod").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        let records = fx.store.inner.find_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].params, token_params("https://127.0.0.1:6443"));
    }

    #[tokio::test]
    async fn test_add_rolls_back_when_persist_fails() {
        let fx = fixture();
        fx.store.fail_create.store(true, Ordering::SeqCst);

        let err = fx
            .manager
            .add_cluster("prod", token_params("https://127.0.0.1:6443"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PersistenceFailed { .. }));
        assert!(fx.manager.registry().get("prod").await.is_none());
        assert!(fx.store.inner.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_cluster_from_request() {
        let fx = fixture();
        let request: ClusterCreate = serde_json::from_value(serde_json::json!({
            "clusterName": "dev",
            "host": "https://127.0.0.1:6443",
            "bearerToken": "abc",
            "tlsClientConfig": { "insecure": true }
        }))
        .unwrap();

        assert_eq!(fx.manager.create_cluster(request).await.unwrap(), "dev");
        assert!(fx.store.inner.contains("dev").await);
    }

    #[tokio::test]
    async fn test_update_swaps_bundle_after_persisting() {
        let fx = fixture();
        fx.manager
            .add_cluster("prod", token_params("https://127.0.0.1:6443"))
            .await
            .unwrap();

        fx.manager
            .update_cluster("prod", token_params("https://127.0.0.2:6443"))
            .await
            .unwrap();

        let bundle = fx.manager.registry().get("prod").await.unwrap();
        assert_eq!(bundle.params().host, "https://127.0.0.2:6443");
        let records = fx.store.inner.find_all().await.unwrap();
        assert_eq!(records[0].params.host, "https://127.0.0.2:6443");
    }

    #[tokio::test]
    async fn test_update_keeps_old_bundle_when_persist_fails() {
        let fx = fixture();
        fx.manager
            .add_cluster("prod", token_params("https://127.0.0.1:6443"))
            .await
            .unwrap();
        fx.store.fail_update.store(true, Ordering::SeqCst);

        let err = fx
            .manager
            .update_cluster("prod", token_params("https://127.0.0.2:6443"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::PersistenceFailed { .. }));

        let bundle = fx.manager.registry().get("prod").await.unwrap();
        assert_eq!(bundle.params().host, "https://127.0.0.1:6443");
    }

    #[tokio::test]
    async fn test_update_rejects_missing_and_static_clusters() {
        let fx = fixture();
        let _kubeconfig = with_static_cluster(&fx).await;

        assert!(matches!(
            fx.manager
                .update_cluster("ghost", token_params("https://127.0.0.1:6443"))
                .await,
            Err(ClusterError::ClusterNotFound(_))
        ));
        assert!(matches!(
            fx.manager
                .update_cluster("local", token_params("https://127.0.0.2:6443"))
                .await,
            Err(ClusterError::ImmutableCluster(_))
        ));
        let bundle = fx.manager.registry().get("local").await.unwrap();
        assert_eq!(bundle.params().host, "https://127.0.0.1:6443");
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_entry() {
        let fx = fixture();
        fx.manager
            .add_cluster("prod", token_params("https://127.0.0.1:6443"))
            .await
            .unwrap();

        fx.manager.delete_cluster("prod").await.unwrap();
        assert!(fx.manager.registry().get("prod").await.is_none());
        assert!(fx.store.inner.names().await.is_empty());

        // The name is immediately reusable.
        fx.manager
            .add_cluster("prod", token_params("https://127.0.0.2:6443"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_of_static_cluster_changes_nothing() {
        let fx = fixture();
        let _kubeconfig = with_static_cluster(&fx).await;
        fx.manager
            .add_cluster("prod", token_params("https://127.0.0.2:6443"))
            .await
            .unwrap();

        assert!(matches!(
            fx.manager.delete_cluster("local").await,
            Err(ClusterError::ImmutableCluster(_))
        ));
        assert_eq!(fx.manager.registry().list_names().await, vec!["local", "prod"]);
        assert!(fx.manager.registry().is_static("local").await);
        assert_eq!(fx.store.inner.names().await, vec!["prod"]);
    }

    #[tokio::test]
    async fn test_failed_delete_orphans_backup_and_keeps_entry() {
        let fx = fixture();
        fx.manager
            .add_cluster("prod", token_params("https://127.0.0.1:6443"))
            .await
            .unwrap();
        fx.store.fail_delete.store(true, Ordering::SeqCst);

        assert!(matches!(
            fx.manager.delete_cluster("prod").await,
            Err(ClusterError::PersistenceFailed { .. })
        ));
        assert!(fx.manager.registry().get("prod").await.is_some());

        let names = fx.store.inner.names().await;
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("prod_"));
    }

    #[tokio::test]
    async fn test_delete_unknown_cluster() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.delete_cluster("ghost").await,
            Err(ClusterError::ClusterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_boot_loads_static_and_persisted_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KUBECONFIG.as_bytes()).unwrap();

        let store = Arc::new(MemoryClusterStore::new());
        for (name, host) in [("prod", "https://127.0.0.2:6443"), ("dev", "https://127.0.0.3:6443")] {
            store
                .create(&PersistedClusterRecord::new(name, token_params(host)))
                .await
                .unwrap();
        }

        let manager = ClusterManager::new(
            ClusterRegistry::new(),
            store,
            test_builder(dir.path()),
            Duration::from_secs(2),
        );
        let sources = StaticClusterSources {
            in_cluster: false,
            kubeconfig: Some(file.path().to_path_buf()),
        };
        manager.boot(&sources).await.unwrap();

        let registry = manager.registry();
        assert_eq!(registry.list_names().await, vec!["dev", "local", "prod"]);
        assert!(registry.is_static("local").await);
        assert!(!registry.is_static("prod").await);
        assert!(!registry.is_static("dev").await);
    }

    #[tokio::test]
    async fn test_boot_fails_on_unreadable_store() {
        let fx = fixture();
        fx.store.fail_find.store(true, Ordering::SeqCst);

        assert!(matches!(
            fx.manager.boot(&StaticClusterSources::default()).await,
            Err(ClusterError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_boot_fails_on_malformed_record() {
        let fx = fixture();
        let malformed = ConnectionParameters::new("not a url").with_bearer_token("t");
        fx.store
            .inner
            .create(&PersistedClusterRecord::new("broken", malformed))
            .await
            .unwrap();

        assert!(matches!(
            fx.manager.load_persisted().await,
            Err(ClusterError::InvalidParameters(_))
        ));
        assert!(fx.manager.registry().get("broken").await.is_none());
    }

    #[tokio::test]
    async fn test_cluster_infos_are_sorted_and_omit_credentials() {
        let fx = fixture();
        let _kubeconfig = with_static_cluster(&fx).await;
        fx.manager
            .add_cluster("prod", token_params("https://127.0.0.2:6443"))
            .await
            .unwrap();

        let infos = fx.manager.cluster_infos(false).await;
        let names: Vec<&str> = infos.iter().map(|i| i.cluster_name.as_str()).collect();
        assert_eq!(names, vec!["local", "prod"]);
        assert!(infos[0].is_static);
        assert!(!infos[1].is_static);
        assert_eq!(infos[1].status, STATUS_UNKNOWN);

        let rendered = serde_json::to_string(&infos).unwrap();
        assert!(!rendered.contains("test-token"));
        assert!(!rendered.contains("local-token"));

        assert!(matches!(
            fx.manager.cluster_info("ghost", false).await,
            Err(ClusterError::ClusterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_forced_info_probes_the_cluster() {
        let fx = fixture();
        fx.manager
            .add_cluster("down", token_params("https://127.0.0.1:1"))
            .await
            .unwrap();

        let info = fx.manager.cluster_info("down", true).await.unwrap();
        assert_ne!(info.status, STATUS_UNKNOWN);
        assert!(info.last_refreshed.is_some());
    }

    #[test]
    fn test_backup_name_shape() {
        let backup = backup_name("prod");
        let suffix = backup.strip_prefix("prod_").unwrap();
        assert_eq!(suffix.len(), BACKUP_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
