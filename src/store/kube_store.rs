//! Kubernetes-backed record store
//!
//! Thin adapter from [`RecordStore`] to `kube::Api`. Version conflicts
//! surface as [`Error::Conflict`] through the `From<kube::Error>` mapping.
//! The change feed watches only the records matching the store's watch
//! labels and backs off while the API server is failing.

use crate::domain::ports::{LabelSelector, RecordStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, warn};

/// Record store over a namespaced custom resource
pub struct KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    api: Api<K>,
    /// Write the status subresource on update
    write_status: bool,
    /// Labels a record must carry to wake the change feed
    watch_labels: LabelSelector,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            write_status: true,
            watch_labels: LabelSelector::new(),
        }
    }

    /// Store for a resource whose status is owned by someone else
    pub fn spec_only(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            write_status: false,
            watch_labels: LabelSelector::new(),
        }
    }

    /// Restrict the change feed to records carrying `labels`
    pub fn watching(mut self, labels: LabelSelector) -> Self {
        self.watch_labels = labels;
        self
    }
}

fn watch_config(labels: &LabelSelector) -> watcher::Config {
    let config = watcher::Config::default();
    if labels.is_empty() {
        config
    } else {
        config.labels(&selector_string(labels))
    }
}

/// One wake per applied event; failures are logged and dropped
fn wakes<T, E>(
    events: impl Stream<Item = std::result::Result<T, E>> + Send + 'static,
    kind: String,
) -> BoxStream<'static, ()>
where
    E: std::fmt::Display,
{
    events
        .filter_map(move |event| {
            let wake = match event {
                Ok(_) => Some(()),
                Err(e) => {
                    warn!("Watch on {} failed: {}", kind, e);
                    None
                }
            };
            futures::future::ready(wake)
        })
        .boxed()
}

fn selector_string(selector: &LabelSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl<K> RecordStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        Ok(self.api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let created = self.api.create(&PostParams::default(), obj).await?;
        if !self.write_status {
            return Ok(created);
        }
        // Status is a subresource and is dropped on create
        let mut with_status = obj.clone();
        with_status.meta_mut().resource_version = created.meta().resource_version.clone();
        let body = serde_json::to_vec(&with_status)?;
        Ok(self
            .api
            .replace_status(&created.name_any(), &PostParams::default(), body)
            .await?)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let replaced = self.api.replace(&name, &PostParams::default(), obj).await?;
        if !self.write_status {
            return Ok(replaced);
        }
        let mut with_status = obj.clone();
        with_status.meta_mut().resource_version = replaced.meta().resource_version.clone();
        let body = serde_json::to_vec(&with_status)?;
        debug!("Replacing status of {}/{}", K::kind(&()), name);
        Ok(self
            .api
            .replace_status(&name, &PostParams::default(), body)
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    Err(Error::ResourceNotFound {
                        kind: K::kind(&()).to_string(),
                        name: name.to_string(),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    fn changes(&self) -> BoxStream<'static, ()> {
        let events = watcher(self.api.clone(), watch_config(&self.watch_labels)).default_backoff();
        wakes(events, K::kind(&()).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_string() {
        let mut selector = LabelSelector::new();
        selector.insert("a".into(), "1".into());
        selector.insert("b".into(), "2".into());
        assert_eq!(selector_string(&selector), "a=1,b=2");
    }

    #[test]
    fn test_watch_config_carries_labels() {
        assert_eq!(watch_config(&LabelSelector::new()).label_selector, None);

        let mut selector = LabelSelector::new();
        selector.insert("storage.billyronks.io/node".into(), "node-1".into());
        assert_eq!(
            watch_config(&selector).label_selector.as_deref(),
            Some("storage.billyronks.io/node=node-1")
        );
    }

    #[tokio::test]
    async fn test_watch_errors_do_not_wake() {
        let events = futures::stream::iter(vec![Ok(1), Err("forbidden"), Err("forbidden"), Ok(2)]);
        let woken: Vec<()> = wakes(events, "BlockDevice".into()).collect().await;
        assert_eq!(woken.len(), 2);
    }
}
