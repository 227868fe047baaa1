//! Clusters sourced from local configuration at boot

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::Result;

/// Registry name of the in-cluster service account identity
pub const IN_CLUSTER_NAME: &str = "in-cluster";

/// A cluster defined by local configuration
#[derive(Clone, Debug)]
pub struct StaticCluster {
    pub name: String,
    pub config: Config,
}

/// Where static clusters come from
#[derive(Clone, Debug, Default)]
pub struct StaticClusterSources {
    /// Register the pod's own service account identity
    pub in_cluster: bool,
    /// Register every context of this kubeconfig file
    pub kubeconfig: Option<PathBuf>,
}

impl StaticClusterSources {
    /// Resolve every configured source into client configs.
    ///
    /// Kubeconfig contexts are returned sorted by name. Any unreadable source
    /// fails the whole load.
    pub async fn load(&self) -> Result<Vec<StaticCluster>> {
        let mut clusters = Vec::new();

        if self.in_cluster {
            let config = Config::incluster()?;
            info!("Loaded in-cluster configuration for {}", config.cluster_url);
            clusters.push(StaticCluster {
                name: IN_CLUSTER_NAME.to_string(),
                config,
            });
        }

        if let Some(path) = &self.kubeconfig {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let mut contexts: Vec<String> = kubeconfig
                .contexts
                .iter()
                .map(|context| context.name.clone())
                .collect();
            contexts.sort();
            info!("Loading {} contexts from {}", contexts.len(), path.display());

            for name in contexts {
                let options = KubeConfigOptions {
                    context: Some(name.clone()),
                    ..Default::default()
                };
                let config = Config::from_custom_kubeconfig(kubeconfig.clone(), &options).await?;
                debug!("Loaded kubeconfig context {} ({})", name, config.cluster_url);
                clusters.push(StaticCluster { name, config });
            }
        }

        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClusterError;
    use std::io::Write;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: staging
clusters:
- name: prod-cluster
  cluster:
    server: https://10.0.0.1:6443
    insecure-skip-tls-verify: true
- name: staging-cluster
  cluster:
    server: https://10.0.0.2:6443
    insecure-skip-tls-verify: true
users:
- name: admin
  user:
    token: local-token
contexts:
- name: staging
  context:
    cluster: staging-cluster
    user: admin
- name: prod
  context:
    cluster: prod-cluster
    user: admin
"#;

    #[tokio::test]
    async fn test_no_sources_yield_nothing() {
        let clusters = StaticClusterSources::default().load().await.unwrap();
        assert!(clusters.is_empty());
    }

    #[tokio::test]
    async fn test_loads_every_kubeconfig_context_sorted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KUBECONFIG.as_bytes()).unwrap();

        let sources = StaticClusterSources {
            in_cluster: false,
            kubeconfig: Some(file.path().to_path_buf()),
        };
        let clusters = sources.load().await.unwrap();

        let names: Vec<&str> = clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["prod", "staging"]);
        assert_eq!(clusters[0].config.cluster_url.host(), Some("10.0.0.1"));
        assert_eq!(clusters[1].config.cluster_url.host(), Some("10.0.0.2"));
        assert!(clusters[0].config.accept_invalid_certs);
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sources = StaticClusterSources {
            in_cluster: false,
            kubeconfig: Some(dir.path().join("missing.yaml")),
        };
        assert!(matches!(
            sources.load().await,
            Err(ClusterError::Kubeconfig(_))
        ));
    }
}
