//! Periodic health refresh of every registered cluster

use chrono::{DateTime, Utc};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client};
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

use crate::connection::ClusterStatus;
use crate::{ClusterRegistry, ConnectionBundle};

/// Status reported for a cluster whose last probe fully succeeded
pub const STATUS_HEALTHY: &str = "Running";

/// Refresher configuration
#[derive(Clone, Debug)]
pub struct RefreshConfig {
    /// Pause between two sweeps
    pub interval: Duration,
    /// Upper bound for each probe call against one cluster
    pub timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Background task that keeps version, node count and status current
pub struct ClusterRefresher {
    registry: ClusterRegistry,
    config: RefreshConfig,
}

impl ClusterRefresher {
    pub fn new(registry: ClusterRegistry, config: RefreshConfig) -> Self {
        Self { registry, config }
    }

    /// Sweep forever, starting immediately
    pub async fn run(&self) {
        debug!("Cluster refresher started with interval: {:?}", self.config.interval);
        loop {
            self.sweep().await;
            time::sleep(self.config.interval).await;
        }
    }

    /// Probe every registered cluster once, concurrently.
    ///
    /// Returns the number of clusters that are not healthy.
    pub async fn sweep(&self) -> usize {
        let clusters = self.registry.list().await;
        let total = clusters.len();

        let probes = clusters.iter().map(|(name, bundle)| async move {
            let healthy = refresh_cluster(bundle, self.config.timeout).await;
            if !healthy {
                warn!(cluster = %name, "Cluster health check failed: {}", bundle.status().await.status);
            }
            healthy
        });
        let unhealthy = join_all(probes).await.into_iter().filter(|ok| !ok).count();

        debug!("Refreshed {} clusters, {} unhealthy", total, unhealthy);
        unhealthy
    }
}

/// Probe one cluster and record the outcome on its bundle.
///
/// Only the bundle's own status lock is taken, and only after both calls
/// have finished.
pub async fn refresh_cluster(bundle: &ConnectionBundle, timeout: Duration) -> bool {
    let version = bounded(timeout, async {
        bundle.discovery().server_version().await.map_err(|e| e.to_string())
    });
    let nodes = bounded(timeout, async {
        node_count(bundle.client()).await.map_err(|e| e.to_string())
    });
    let (version, nodes) = tokio::join!(version, nodes);

    let mut healthy = false;
    bundle
        .update_status(|status| {
            apply_probe(status, version, nodes, Utc::now());
            healthy = status.status == STATUS_HEALTHY;
        })
        .await;
    healthy
}

async fn node_count(client: &Client) -> Result<u32, kube::Error> {
    let nodes = Api::<Node>::all(client.clone())
        .list_metadata(&ListParams::default())
        .await?;
    Ok(u32::try_from(nodes.items.len()).unwrap_or(u32::MAX))
}

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, String>>,
) -> Result<T, String> {
    match time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(format!("timed out after {:?}", timeout)),
    }
}

/// Fold one probe's results into a cluster status.
///
/// Values from successful calls replace the old ones; failed calls keep the
/// last known value. Distinct errors are joined in call order.
fn apply_probe(
    status: &mut ClusterStatus,
    version: Result<String, String>,
    nodes: Result<u32, String>,
    now: DateTime<Utc>,
) {
    let mut errors: Vec<String> = Vec::new();

    match version {
        Ok(version) => status.version = version,
        Err(e) => errors.push(e),
    }
    match nodes {
        Ok(count) => status.node_count = count,
        Err(e) if !errors.contains(&e) => errors.push(e),
        Err(_) => {}
    }

    status.status = if errors.is_empty() {
        STATUS_HEALTHY.to_string()
    } else {
        errors.join(". ")
    };
    status.last_refreshed = Some(now);
}
