//! Server configuration loaded from YAML

use anyhow::{bail, Context, Result};
use console_core::{ConnectionSettings, DiscoverySettings, RefreshConfig, StaticClusterSources};
use serde::Deserialize;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Address of the HTTP listener
    pub listen: SocketAddr,
    pub database: DatabaseSettings,
    pub kubernetes: KubernetesSettings,
    pub refresh: RefreshSettings,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8080).into(),
            database: DatabaseSettings::default(),
            kubernetes: KubernetesSettings::default(),
            refresh: RefreshSettings::default(),
            log: LogSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSettings {
    /// PostgreSQL URL; clusters are kept in memory when unset
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KubernetesSettings {
    /// Every context of this file is registered as a static cluster
    pub kubeconfig: Option<PathBuf>,
    /// Register the pod's service account as a static cluster
    pub in_cluster: bool,
    pub discovery_cache_dir: PathBuf,
    pub discovery_ttl_secs: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            in_cluster: false,
            discovery_cache_dir: PathBuf::from("./cache/discovery"),
            discovery_ttl_secs: 3 * 60 * 60,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefreshSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    /// Read settings from `path`.
    ///
    /// A missing file yields the defaults unless `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml(&contents)
                .with_context(|| format!("invalid configuration in {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.refresh.interval_secs == 0 {
            bail!("refresh.interval_secs must be at least 1");
        }
        if self.refresh.timeout_secs == 0 {
            bail!("refresh.timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        let kubernetes = &self.kubernetes;
        ConnectionSettings {
            discovery: DiscoverySettings {
                cache_dir: kubernetes.discovery_cache_dir.clone(),
                ttl: Duration::from_secs(kubernetes.discovery_ttl_secs),
                request_timeout: Duration::from_secs(kubernetes.read_timeout_secs),
            },
            connect_timeout: Duration::from_secs(kubernetes.connect_timeout_secs),
            read_timeout: Duration::from_secs(kubernetes.read_timeout_secs),
        }
    }

    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            interval: Duration::from_secs(self.refresh.interval_secs),
            timeout: Duration::from_secs(self.refresh.timeout_secs),
        }
    }

    pub fn static_sources(&self) -> StaticClusterSources {
        StaticClusterSources {
            in_cluster: self.kubernetes.in_cluster,
            kubeconfig: self.kubernetes.kubeconfig.clone(),
        }
    }
}
