//! Connection bundles: the clients used to talk to one cluster

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use console_api::ConnectionParameters;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::api::{ApiResource, DynamicObject};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde_json::{json, Map, Value};
use std::sync::Once;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

use crate::discovery::{CachedDiscovery, DiscoverySettings};
use crate::error::ConnectError;

/// Status shown before the first health probe completes
pub const STATUS_UNKNOWN: &str = "Unknown";

/// Context name used for kubeconfigs assembled from connection parameters
const GENERATED_CONTEXT: &str = "console";

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the process-wide rustls provider used by every client
pub(crate) fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        // Another component may have installed one already, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Client construction settings shared by all clusters
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub discovery: DiscoverySettings,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            discovery: DiscoverySettings::default(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Untyped client for resources known only at runtime
#[derive(Clone)]
pub struct DynamicClient {
    client: Client,
}

impl DynamicClient {
    fn new(config: Config) -> Result<Self, kube::Error> {
        Ok(Self {
            client: Client::try_from(config)?,
        })
    }

    /// Api handle for a resource, cluster-wide when `namespace` is `None`
    pub fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    /// Find the resource named `plural` in a discovered resource list
    pub fn resolve(lists: &[APIResourceList], group_version: &str, plural: &str) -> Option<ApiResource> {
        let (group, version) = match group_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", group_version),
        };
        lists
            .iter()
            .filter(|list| list.group_version == group_version)
            .flat_map(|list| list.resources.iter())
            .find(|resource| resource.name == plural)
            .map(|resource| ApiResource {
                group: group.to_string(),
                version: version.to_string(),
                api_version: group_version.to_string(),
                kind: resource.kind.clone(),
                plural: resource.name.clone(),
            })
    }
}

/// Observability fields refreshed by health probes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterStatus {
    pub version: String,
    pub node_count: u32,
    pub status: String,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl Default for ClusterStatus {
    fn default() -> Self {
        Self {
            version: String::new(),
            node_count: 0,
            status: STATUS_UNKNOWN.to_string(),
            last_refreshed: None,
        }
    }
}

/// Live clients for one cluster plus its last known health
///
/// Every field except the status is fixed once the bundle is built; the
/// status has its own lock so probes never contend with registry access.
pub struct ConnectionBundle {
    client: Client,
    dynamic: DynamicClient,
    discovery: CachedDiscovery,
    params: ConnectionParameters,
    is_static: bool,
    request_timeout: Duration,
    created_at: DateTime<Utc>,
    status: RwLock<ClusterStatus>,
}

impl ConnectionBundle {
    /// Typed client
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn dynamic(&self) -> &DynamicClient {
        &self.dynamic
    }

    pub fn discovery(&self) -> &CachedDiscovery {
        &self.discovery
    }

    /// Parameters the bundle was built from
    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Upper bound for one call against this cluster
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn status(&self) -> RwLockReadGuard<'_, ClusterStatus> {
        self.status.read().await
    }

    /// Apply a change to the status fields under the bundle's own lock
    pub async fn update_status(&self, f: impl FnOnce(&mut ClusterStatus)) {
        let mut status = self.status.write().await;
        f(&mut status);
    }
}

impl std::fmt::Debug for ConnectionBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBundle")
            .field("host", &self.params.host)
            .field("is_static", &self.is_static)
            .field("discovery", &self.discovery.strategy())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Builds connection bundles from connection parameters or client configs
#[derive(Clone, Debug)]
pub struct ConnectionBuilder {
    settings: ConnectionSettings,
}

impl ConnectionBuilder {
    pub fn new(settings: ConnectionSettings) -> Self {
        install_crypto_provider();
        Self { settings }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Build a bundle for a dynamic cluster
    pub async fn build(&self, params: &ConnectionParameters) -> Result<ConnectionBundle, ConnectError> {
        let config = self.rest_config(params).await?;
        self.assemble(config, params.clone(), false).await
    }

    /// Build a bundle for a cluster sourced from local configuration
    pub async fn build_static(&self, mut config: Config) -> Result<ConnectionBundle, ConnectError> {
        self.apply_timeouts(&mut config);
        let params = ConnectionParameters {
            host: config.cluster_url.to_string().trim_end_matches('/').to_string(),
            tls_insecure: config.accept_invalid_certs,
            ..Default::default()
        };
        self.assemble(config, params, true).await
    }

    /// Client configuration equivalent to `params`
    pub async fn rest_config(&self, params: &ConnectionParameters) -> Result<Config, ConnectError> {
        let kubeconfig = generated_kubeconfig(params)?;
        let options = KubeConfigOptions {
            context: Some(GENERATED_CONTEXT.to_string()),
            ..Default::default()
        };
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &options).await?;
        self.apply_timeouts(&mut config);
        Ok(config)
    }

    fn apply_timeouts(&self, config: &mut Config) {
        config.connect_timeout = Some(self.settings.connect_timeout);
        config.read_timeout = Some(self.settings.read_timeout);
    }

    // All three clients are built before anything is returned.
    async fn assemble(
        &self,
        config: Config,
        params: ConnectionParameters,
        is_static: bool,
    ) -> Result<ConnectionBundle, ConnectError> {
        let client = Client::try_from(config.clone())?;
        let dynamic = DynamicClient::new(config.clone())?;
        let discovery = CachedDiscovery::new(&config, &self.settings.discovery).await?;

        debug!(
            "Built connection bundle for {} ({:?} discovery)",
            params.host,
            discovery.strategy()
        );

        Ok(ConnectionBundle {
            client,
            dynamic,
            discovery,
            params,
            is_static,
            request_timeout: self.settings.discovery.request_timeout,
            created_at: Utc::now(),
            status: RwLock::new(ClusterStatus::default()),
        })
    }
}

/// Single-context kubeconfig carrying `params`
fn generated_kubeconfig(params: &ConnectionParameters) -> Result<Kubeconfig, serde_json::Error> {
    let mut cluster = Map::new();
    cluster.insert("server".into(), json!(params.host));
    cluster.insert("insecure-skip-tls-verify".into(), json!(params.tls_insecure));
    if let Some(ca) = &params.ca_data {
        cluster.insert("certificate-authority-data".into(), json!(STANDARD.encode(ca)));
    }

    let mut user = Map::new();
    if let Some(token) = &params.bearer_token {
        user.insert("token".into(), json!(token));
    }
    if let Some(cert) = &params.cert_data {
        user.insert("client-certificate-data".into(), json!(STANDARD.encode(cert)));
    }
    if let Some(key) = &params.key_data {
        user.insert("client-key-data".into(), json!(STANDARD.encode(key)));
    }

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": GENERATED_CONTEXT, "cluster": Value::Object(cluster) }],
        "users": [{ "name": GENERATED_CONTEXT, "user": Value::Object(user) }],
        "contexts": [{
            "name": GENERATED_CONTEXT,
            "context": { "cluster": GENERATED_CONTEXT, "user": GENERATED_CONTEXT },
        }],
        "current-context": GENERATED_CONTEXT,
    }))
}
