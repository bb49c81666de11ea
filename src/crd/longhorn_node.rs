//! Longhorn Node projection
//!
//! The filesystem and raw-block backends publish disks through Longhorn's
//! per-node record (`nodes.longhorn.io`). Only the fields the agent reads or
//! writes are typed; everything else round-trips through `extra` so a
//! replace never drops fields owned by Longhorn.

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longhorn's per-node disk map
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "longhorn.io",
    version = "v1beta2",
    kind = "Node",
    root = "LonghornNode",
    status = "LonghornNodeStatus",
    derive = "PartialEq",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LonghornNodeSpec {
    /// Disks keyed by disk name (the BlockDevice GUID for agent-owned disks)
    #[serde(default)]
    pub disks: BTreeMap<String, LonghornDiskSpec>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Longhorn disk type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LonghornDiskType {
    #[default]
    Filesystem,
    Block,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LonghornDiskSpec {
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub disk_type: LonghornDiskType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub disk_driver: String,

    #[serde(default)]
    pub allow_scheduling: bool,

    #[serde(default)]
    pub eviction_requested: bool,

    #[serde(default)]
    pub storage_reserved: i64,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LonghornNodeStatus {
    #[serde(default)]
    pub disk_status: BTreeMap<String, LonghornDiskStatus>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LonghornDiskStatus {
    /// Replicas scheduled on the disk, keyed by replica name
    #[serde(default)]
    pub scheduled_replica: BTreeMap<String, i64>,

    #[serde(default, rename = "diskUUID")]
    pub disk_uuid: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl LonghornNode {
    pub fn disk(&self, name: &str) -> Option<&LonghornDiskSpec> {
        self.spec.disks.get(name)
    }

    /// Number of replicas still scheduled on a disk
    pub fn scheduled_replicas(&self, name: &str) -> usize {
        self.status
            .as_ref()
            .and_then(|s| s.disk_status.get(name))
            .map(|d| d.scheduled_replica.len())
            .unwrap_or(0)
    }
}
