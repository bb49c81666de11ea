//! LvmVolumeGroup CRD
//!
//! Desired and observed membership of an LVM volume group on one node. The
//! record name is generated; the logical group is identified by
//! `(spec.nodeName, spec.vgName)`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the volume group name
pub const LABEL_VG_NAME: &str = "storage.billyronks.io/vg-name";

// =============================================================================
// LvmVolumeGroup CRD
// =============================================================================

/// LvmVolumeGroup tracks which block devices back a volume group
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "LvmVolumeGroup",
    plural = "lvmvolumegroups",
    shortname = "lvmvg",
    status = "LvmVolumeGroupStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "VG", "type": "string", "jsonPath": ".spec.vgName"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LvmVolumeGroupSpec {
    pub node_name: String,

    pub vg_name: String,

    /// Member devices keyed by BlockDevice GUID, valued by device path
    #[serde(default)]
    pub devices: BTreeMap<String, String>,

    #[serde(default)]
    pub desired_state: VgDesiredState,

    /// Extra vgcreate parameters
    #[serde(default)]
    pub parameters: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VgDesiredState {
    #[default]
    Enabled,
    Disabled,
}

/// Observed aggregate status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VgStatus {
    Active,
    Inactive,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LvmVolumeGroupStatus {
    #[serde(default)]
    pub status: VgStatus,

    /// Devices currently in the group, keyed like the spec
    #[serde(default)]
    pub devices: BTreeMap<String, String>,

    #[serde(default)]
    pub conditions: Vec<VgCondition>,
}

/// Named condition on a volume group (e.g. "DeviceAdded", "VgReady")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VgCondition {
    pub r#type: String,
    pub status: bool,
    #[serde(default)]
    pub message: String,
}

impl LvmVolumeGroup {
    pub fn vg_status(&self) -> VgStatus {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }

    pub fn set_condition(&mut self, ty: &str, status: bool, message: impl Into<String>) {
        let conditions = &mut self
            .status
            .get_or_insert_with(LvmVolumeGroupStatus::default)
            .conditions;
        let message = message.into();
        match conditions.iter_mut().find(|c| c.r#type == ty) {
            Some(existing) => {
                existing.status = status;
                existing.message = message;
            }
            None => conditions.push(VgCondition {
                r#type: ty.to_string(),
                status,
                message,
            }),
        }
    }
}

/// Generate a record name for a new group
pub fn generate_vg_record_name(vg_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", vg_name.to_lowercase(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_are_unique() {
        let a = generate_vg_record_name("VG0");
        let b = generate_vg_record_name("VG0");
        assert!(a.starts_with("vg0-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_condition() {
        let mut vg = LvmVolumeGroup::new(
            "vg0-abc",
            LvmVolumeGroupSpec {
                node_name: "node-1".into(),
                vg_name: "vg0".into(),
                devices: BTreeMap::new(),
                desired_state: VgDesiredState::Enabled,
                parameters: None,
            },
        );
        assert_eq!(vg.vg_status(), VgStatus::Unknown);
        vg.set_condition("VgReady", false, "creating");
        vg.set_condition("VgReady", true, "");
        let status = vg.status.unwrap();
        assert_eq!(status.conditions.len(), 1);
        assert!(status.conditions[0].status);
    }
}
