//! Generic resource calls against a registered cluster
//!
//! Every list goes through [`select`] so filtering, ordering and paging behave
//! the same for every resource type.

use console_api::{DataSelectQuery, Page};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, DynamicObject, ListParams};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use tracing::debug;

use crate::{select, ClusterError, ClusterRegistry, ConnectionBundle, DynamicClient, Result, Selectable};

/// List a namespaced resource in one namespace, or across all of them
pub async fn list<K>(
    registry: &ClusterRegistry,
    cluster: &str,
    namespace: Option<&str>,
    query: &DataSelectQuery,
) -> Result<Page<K>>
where
    K: Resource<Scope = NamespaceResourceScope> + Selectable + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let bundle = registry.use_cluster(cluster).await?;
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(bundle.client().clone(), ns),
        None => Api::all(bundle.client().clone()),
    };
    list_with(&bundle, cluster, api, query).await
}

/// List a cluster-scoped resource such as nodes or namespaces
pub async fn list_cluster_scoped<K>(
    registry: &ClusterRegistry,
    cluster: &str,
    query: &DataSelectQuery,
) -> Result<Page<K>>
where
    K: Resource<Scope = ClusterResourceScope> + Selectable + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let bundle = registry.use_cluster(cluster).await?;
    let api: Api<K> = Api::all(bundle.client().clone());
    list_with(&bundle, cluster, api, query).await
}

/// List a resource known only by group version and plural name
pub async fn list_dynamic(
    registry: &ClusterRegistry,
    cluster: &str,
    group_version: &str,
    plural: &str,
    namespace: Option<&str>,
    query: &DataSelectQuery,
) -> Result<Page<DynamicObject>> {
    let bundle = registry.use_cluster(cluster).await?;
    let lists = bundle.discovery().server_groups_and_resources().await?;
    let resource = DynamicClient::resolve(&lists, group_version, plural).ok_or_else(|| {
        ClusterError::UnknownResource {
            cluster: cluster.to_string(),
            group_version: group_version.to_string(),
            plural: plural.to_string(),
        }
    })?;
    let api = bundle.dynamic().api(&resource, namespace);
    list_with(&bundle, cluster, api, query).await
}

/// Fetch one namespaced object by name
pub async fn get<K>(registry: &ClusterRegistry, cluster: &str, namespace: &str, name: &str) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let bundle = registry.use_cluster(cluster).await?;
    let api: Api<K> = Api::namespaced(bundle.client().clone(), namespace);
    bounded(&bundle, cluster, api.get(name)).await
}

/// Delete one namespaced object by name
pub async fn delete<K>(registry: &ClusterRegistry, cluster: &str, namespace: &str, name: &str) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let bundle = registry.use_cluster(cluster).await?;
    let api: Api<K> = Api::namespaced(bundle.client().clone(), namespace);
    bounded(&bundle, cluster, api.delete(name, &DeleteParams::default())).await?;
    debug!(cluster = %cluster, "Deleted {}/{}", namespace, name);
    Ok(())
}

async fn list_with<K>(
    bundle: &ConnectionBundle,
    cluster: &str,
    api: Api<K>,
    query: &DataSelectQuery,
) -> Result<Page<K>>
where
    K: Selectable + Clone + DeserializeOwned + Debug,
{
    let list = bounded(bundle, cluster, api.list(&ListParams::default())).await?;
    Ok(select(list.items, query))
}

async fn bounded<T>(
    bundle: &ConnectionBundle,
    cluster: &str,
    call: impl Future<Output = std::result::Result<T, kube::Error>>,
) -> Result<T> {
    let timeout = bundle.request_timeout();
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ClusterError::Timeout {
            cluster: cluster.to_string(),
            timeout,
        })?
        .map_err(ClusterError::from)
}
