//! In-process record store
//!
//! Versioned map of records with the same optimistic-concurrency contract as
//! the Kubernetes API: every write bumps `metadata.resourceVersion`, and an
//! update carrying a stale version fails with a conflict. Used for
//! standalone runs and throughout the tests.

use crate::domain::ports::{LabelSelector, RecordStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// In-memory versioned store for one record kind
pub struct MemoryStore<K> {
    records: RwLock<BTreeMap<String, K>>,
    version: AtomicU64,
    events: broadcast::Sender<()>,
    /// Conflicts to inject on the next updates
    injected_conflicts: AtomicUsize,
    update_calls: AtomicUsize,
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            records: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
            injected_conflicts: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` updates fail with a version conflict
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of update calls received so far
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of every record
    pub fn all(&self) -> Vec<K> {
        self.records.read().values().cloned().collect()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn notify(&self) {
        // No subscribers is fine
        let _ = self.events.send(());
    }
}

impl<K> Default for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn matches_selector<K: Resource>(obj: &K, selector: &LabelSelector) -> bool {
    let labels = obj.labels();
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
}

#[async_trait]
impl<K> RecordStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.records.read().get(name).cloned())
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|obj| matches_selector(*obj, selector))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let created = {
            let mut records = self.records.write();
            if records.contains_key(&name) {
                return Err(Error::ResourceExists {
                    kind: Self::kind(),
                    name,
                });
            }
            let mut created = obj.clone();
            created.meta_mut().resource_version = Some(self.next_version());
            records.insert(name, created.clone());
            created
        };
        self.notify();
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let name = obj.name_any();

        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Conflict {
                kind: Self::kind(),
                name,
            });
        }

        let updated = {
            let mut records = self.records.write();
            let current = records.get(&name).ok_or_else(|| Error::ResourceNotFound {
                kind: Self::kind(),
                name: name.clone(),
            })?;
            if current.meta().resource_version != obj.meta().resource_version {
                return Err(Error::Conflict {
                    kind: Self::kind(),
                    name,
                });
            }
            let mut updated = obj.clone();
            updated.meta_mut().resource_version = Some(self.next_version());
            records.insert(name, updated.clone());
            updated
        };
        self.notify();
        Ok(updated)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let removed = self.records.write().remove(name);
        match removed {
            Some(_) => {
                self.notify();
                Ok(())
            }
            None => Err(Error::ResourceNotFound {
                kind: Self::kind(),
                name: name.to_string(),
            }),
        }
    }

    fn changes(&self) -> BoxStream<'static, ()> {
        let rx = self.events.subscribe();
        futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(((), rx)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}
