//! Optimistic concurrency helper
//!
//! Every record write goes through [`update_with_retry`]: read the current
//! record, apply the mutation, write it back. A version conflict gets exactly
//! one more attempt against a fresh read before it is surfaced.

use crate::domain::ports::RecordStore;
use crate::error::{Error, Result};
use kube::Resource;
use tracing::debug;

/// Read-modify-write `name` with a single retry on conflict
pub async fn update_with_retry<K, F>(store: &dyn RecordStore<K>, name: &str, mut mutate: F) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    F: FnMut(&mut K) + Send,
{
    let mut retried = false;
    loop {
        let mut obj = store.get(name).await?.ok_or_else(|| Error::ResourceNotFound {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        })?;
        mutate(&mut obj);

        match store.update(&obj).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() && !retried => {
                debug!("Conflict updating {}/{}, retrying once", K::kind(&()), name);
                retried = true;
            }
            Err(e) => return Err(e),
        }
    }
}
