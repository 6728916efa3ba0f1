/**
 * Watch sources
 *
 * The list/watch capability a mirror synchronizes against. `KubeSource` talks
 * to the cluster API; tests substitute an in-memory implementation.
 */
use super::config::WATCH_TIMEOUT_SECONDS;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Full listing of one resource kind at a resource version
#[derive(Debug, Clone)]
pub struct Listing<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// Incremental change delivered by a watch stream
#[derive(Debug, Clone)]
pub enum SourceEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying only a newer resource version
    Bookmark(String),
}

#[async_trait]
pub trait WatchSource<K>: Send + Sync {
    /// List every object currently visible to this source
    async fn list(&self) -> Result<Listing<K>>;

    /// Watch for changes after `resource_version`.
    ///
    /// The stream ending means the server closed the watch; an `Err` item means
    /// the watch must be abandoned and the mirror relisted.
    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, Result<SourceEvent<K>>>>;
}

/// Watch source backed by the Kubernetes API
pub struct KubeSource<K> {
    api: Api<K>,
}

impl<K> KubeSource<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    /// Source for a namespaced kind, restricted to `namespace` when given
    #[must_use]
    pub fn namespaced(client: Client, namespace: Option<&str>) -> Self {
        let api = namespace.map_or_else(
            || Api::all(client.clone()),
            |ns| Api::namespaced(client.clone(), ns),
        );
        Self { api }
    }
}

impl<K> KubeSource<K>
where
    K: Resource<Scope = k8s_openapi::ClusterResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    #[must_use]
    pub fn cluster(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl<K> WatchSource<K> for KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Listing<K>> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(Listing {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, Result<SourceEvent<K>>>> {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECONDS);
        let stream = self.api.watch(&wp, resource_version).await?;

        Ok(stream
            .map(|event| match event {
                Ok(WatchEvent::Added(obj)) => Ok(SourceEvent::Added(obj)),
                Ok(WatchEvent::Modified(obj)) => Ok(SourceEvent::Modified(obj)),
                Ok(WatchEvent::Deleted(obj)) => Ok(SourceEvent::Deleted(obj)),
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    Ok(SourceEvent::Bookmark(bookmark.metadata.resource_version))
                }
                Ok(WatchEvent::Error(status)) => Err(Error::Watch(format!("{status:?}"))),
                Err(e) => Err(Error::from(e)),
            })
            .boxed())
    }
}
