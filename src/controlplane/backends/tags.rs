//! Backend tag reconciliation

use std::collections::BTreeSet;

/// Tag set to write to the backend
///
/// Desired tags are always present. A backend tag missing from `desired`
/// is dropped only if `cache` shows this agent put it there; tags added by
/// someone else survive.
pub fn reconcile_tags(desired: &[String], backend: &[String], cache: &[String]) -> Vec<String> {
    let cache: BTreeSet<&String> = cache.iter().collect();
    let mut tags: BTreeSet<String> = desired.iter().cloned().collect();
    tags.extend(backend.iter().filter(|t| !cache.contains(t)).cloned());
    tags.into_iter().collect()
}
