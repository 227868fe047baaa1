//! Server capability discovery with a disk cache and an in-memory fallback
//!
//! The disk cache survives restarts so a fresh process does not rescan every
//! API group of every cluster. When the cache directory cannot be used the
//! client degrades to an in-memory cache; if that cannot be built either the
//! cluster is unusable and construction fails.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIResource, APIResourceList};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::DiscoveryError;

const RESOURCES_FILE: &str = "resources.json";
const WRITE_PROBE_FILE: &str = ".write-probe";

/// Discovery cache configuration
#[derive(Clone, Debug)]
pub struct DiscoverySettings {
    /// Root directory for per-cluster discovery caches
    pub cache_dir: PathBuf,
    /// How long a cached discovery document stays valid
    pub ttl: Duration,
    /// Upper bound for one discovery call against the API server
    pub request_timeout: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/discovery"),
            ttl: Duration::from_secs(3 * 60 * 60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Which cache backs a discovery client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    DiskCache,
    MemoryCache,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CachedResources {
    fetched_at: DateTime<Utc>,
    resources: Vec<APIResourceList>,
}

impl CachedResources {
    fn new(resources: Vec<APIResourceList>) -> Self {
        Self {
            fetched_at: Utc::now(),
            resources,
        }
    }

    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.fetched_at);
        chrono::Duration::from_std(ttl).map_or(true, |ttl| age < ttl)
    }
}

#[derive(Debug)]
struct DiskCache {
    dir: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    async fn new(root: &Path, host: &str, ttl: Duration) -> Result<Self, DiscoveryError> {
        let dir = root.join(host_key(host));
        let probe = dir.join(WRITE_PROBE_FILE);

        let writable = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&probe, b"").await?;
            tokio::fs::remove_file(&probe).await
        };
        if let Err(source) = writable.await {
            return Err(DiscoveryError::Cache { path: dir, source });
        }

        Ok(Self { dir, ttl })
    }

    fn path(&self) -> PathBuf {
        self.dir.join(RESOURCES_FILE)
    }

    async fn load(&self) -> Option<CachedResources> {
        let path = self.path();
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read discovery cache {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice::<CachedResources>(&data) {
            Ok(cached) if cached.is_fresh(self.ttl, Utc::now()) => Some(cached),
            Ok(_) => {
                debug!("Discovery cache {} is stale", path.display());
                None
            }
            Err(e) => {
                warn!("Ignoring corrupt discovery cache {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn store(&self, cached: &CachedResources) {
        let path = self.path();
        let data = match serde_json::to_vec(cached) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode discovery cache: {}", e);
                return;
            }
        };

        // Bundles sharing a host share the directory; each write gets its own temp file.
        let dir = self.dir.clone();
        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to write discovery cache {}: {}", path.display(), e),
            Err(e) => warn!("Discovery cache writer for {} failed: {}", path.display(), e),
        }
    }

    async fn clear(&self) {
        let path = self.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove discovery cache {}: {}", path.display(), e),
        }
    }
}

#[derive(Debug)]
struct MemoryCache {
    entry: RwLock<Option<CachedResources>>,
    ttl: Duration,
}

impl MemoryCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            ttl,
        }
    }

    async fn load(&self) -> Option<CachedResources> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|cached| cached.is_fresh(self.ttl, Utc::now()))
            .cloned()
    }

    async fn store(&self, cached: &CachedResources) {
        *self.entry.write().await = Some(cached.clone());
    }

    async fn clear(&self) {
        *self.entry.write().await = None;
    }
}

#[derive(Debug)]
enum DiscoveryCache {
    Disk(DiskCache),
    Memory(MemoryCache),
}

impl DiscoveryCache {
    async fn load(&self) -> Option<CachedResources> {
        match self {
            DiscoveryCache::Disk(cache) => cache.load().await,
            DiscoveryCache::Memory(cache) => cache.load().await,
        }
    }

    async fn store(&self, cached: &CachedResources) {
        match self {
            DiscoveryCache::Disk(cache) => cache.store(cached).await,
            DiscoveryCache::Memory(cache) => cache.store(cached).await,
        }
    }

    async fn clear(&self) {
        match self {
            DiscoveryCache::Disk(cache) => cache.clear().await,
            DiscoveryCache::Memory(cache) => cache.clear().await,
        }
    }
}

/// Discovery client for one cluster, backed by a disk or memory cache
pub struct CachedDiscovery {
    client: Client,
    cache: DiscoveryCache,
    request_timeout: Duration,
}

impl CachedDiscovery {
    /// Create a discovery client, preferring the disk cache.
    ///
    /// Falls back to the memory cache when the disk cache cannot be set up.
    /// Fails only when neither strategy can be constructed.
    pub async fn new(config: &Config, settings: &DiscoverySettings) -> Result<Self, DiscoveryError> {
        let host = config.cluster_url.to_string();
        Self::with_fallback(&host, settings, || Client::try_from(config.clone())).await
    }

    async fn with_fallback(
        host: &str,
        settings: &DiscoverySettings,
        connect: impl Fn() -> Result<Client, kube::Error>,
    ) -> Result<Self, DiscoveryError> {
        match Self::with_disk_cache(host, settings, &connect).await {
            Ok(discovery) => Ok(discovery),
            Err(disk) => {
                warn!(
                    "Disk cache discovery client for {} unavailable, falling back to memory cache: {}",
                    host, disk
                );
                Self::with_memory_cache(settings, &connect).map_err(|memory| {
                    DiscoveryError::Unavailable {
                        disk: Box::new(disk),
                        memory: Box::new(memory),
                    }
                })
            }
        }
    }

    async fn with_disk_cache(
        host: &str,
        settings: &DiscoverySettings,
        connect: &impl Fn() -> Result<Client, kube::Error>,
    ) -> Result<Self, DiscoveryError> {
        let cache = DiskCache::new(&settings.cache_dir, host, settings.ttl).await?;
        let client = connect().map_err(DiscoveryError::Client)?;
        Ok(Self {
            client,
            cache: DiscoveryCache::Disk(cache),
            request_timeout: settings.request_timeout,
        })
    }

    fn with_memory_cache(
        settings: &DiscoverySettings,
        connect: &impl Fn() -> Result<Client, kube::Error>,
    ) -> Result<Self, DiscoveryError> {
        let client = connect().map_err(DiscoveryError::Client)?;
        Ok(Self {
            client,
            cache: DiscoveryCache::Memory(MemoryCache::new(settings.ttl)),
            request_timeout: settings.request_timeout,
        })
    }

    pub fn strategy(&self) -> DiscoveryStrategy {
        match self.cache {
            DiscoveryCache::Disk(_) => DiscoveryStrategy::DiskCache,
            DiscoveryCache::Memory(_) => DiscoveryStrategy::MemoryCache,
        }
    }

    /// Git version reported by the API server, e.g. `v1.31.2`. Never cached.
    pub async fn server_version(&self) -> Result<String, DiscoveryError> {
        let info = self.bounded(self.client.apiserver_version()).await?;
        Ok(info.git_version)
    }

    /// Every resource list advertised by the server, core group included
    pub async fn server_groups_and_resources(&self) -> Result<Vec<APIResourceList>, DiscoveryError> {
        if let Some(cached) = self.cache.load().await {
            return Ok(cached.resources);
        }

        let timeout = self.request_timeout;
        let (resources, complete) = tokio::time::timeout(timeout, self.fetch_resources())
            .await
            .map_err(|_| DiscoveryError::Timeout(timeout))?
            .map_err(DiscoveryError::Request)?;

        // Partial documents are served but not cached so the next call retries.
        if complete {
            self.cache.store(&CachedResources::new(resources.clone())).await;
        }
        Ok(resources)
    }

    /// Resources of one group version such as `apps/v1` or `v1`
    pub async fn resources_for_group_version(
        &self,
        group_version: &str,
    ) -> Result<Vec<APIResource>, DiscoveryError> {
        let lists = self.server_groups_and_resources().await?;
        Ok(lists
            .into_iter()
            .filter(|list| list.group_version == group_version)
            .flat_map(|list| list.resources)
            .collect())
    }

    /// Drop the cached discovery document
    pub async fn invalidate(&self) {
        self.cache.clear().await;
    }

    async fn fetch_resources(&self) -> Result<(Vec<APIResourceList>, bool), kube::Error> {
        let mut lists = Vec::new();
        let mut complete = true;

        let core = self.client.list_core_api_versions().await?;
        for version in &core.versions {
            lists.push(self.client.list_core_api_resources(version).await?);
        }

        let groups = self.client.list_api_groups().await?;
        for group in &groups.groups {
            for version in &group.versions {
                match self.client.list_api_group_resources(&version.group_version).await {
                    Ok(list) => lists.push(list),
                    Err(e) => {
                        warn!("Skipping unavailable API group {}: {}", version.group_version, e);
                        complete = false;
                    }
                }
            }
        }

        debug!("Discovered {} API resource lists", lists.len());
        Ok((lists, complete))
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, DiscoveryError> {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| DiscoveryError::Timeout(self.request_timeout))?
            .map_err(DiscoveryError::Request)
    }
}

/// Cache directory name for an API server host
fn host_key(host: &str) -> String {
    hex::encode(Sha256::digest(host.as_bytes()))
}
