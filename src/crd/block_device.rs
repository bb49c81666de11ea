//! BlockDevice CRD
//!
//! One record per disk or partition discovered on a node. The record name is
//! the device's content-derived GUID; the spec carries the operator's intent
//! (filesystem, provisioning, tags) and the status carries what the agent
//! observed plus the provisioning phase.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Labels
// =============================================================================

/// Label carrying the owning node name
pub const LABEL_NODE: &str = "storage.billyronks.io/node";

/// Label carrying the device type (disk / part)
pub const LABEL_DEVICE_TYPE: &str = "storage.billyronks.io/device-type";

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// BlockDevice describes one block device on one node and its desired and
/// observed provisioning state.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1",
    kind = "BlockDevice",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".status.deviceStatus.details.deviceType"}"#,
    printcolumn = r#"{"name": "DevPath", "type": "string", "jsonPath": ".status.deviceStatus.devPath"}"#,
    printcolumn = r#"{"name": "MountPoint", "type": "string", "jsonPath": ".status.deviceStatus.fileSystem.mountPoint"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.provisionPhase"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Device path at the time the record was created (e.g. /dev/sdb)
    pub dev_name: String,

    /// Name of the node owning the device
    pub node_name: String,

    /// Filesystem intent
    #[serde(default)]
    pub file_system: FilesystemSpec,

    /// Attach the device to a storage backend
    #[serde(default)]
    pub provision: bool,

    /// Backend selection; the filesystem backend when absent
    #[serde(default)]
    pub provisioner: Option<ProvisionerSpec>,

    /// Tags to publish on the backend disk entry
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Filesystem intent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemSpec {
    /// Where the device should be mounted; empty means unmounted
    #[serde(default)]
    pub mount_point: String,

    /// Format the device even if it already carries a filesystem
    #[serde(default)]
    pub force_formatted: bool,
}

/// Backend selector, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProvisionerSpec {
    /// Filesystem-based disk added by mount path
    Filesystem,
    /// Raw block device consumed directly by the backend
    #[serde(rename_all = "camelCase")]
    RawBlock {
        /// Block driver hint passed to the backend ("auto" when empty)
        #[serde(default)]
        disk_driver: String,
    },
    /// Physical volume in an LVM volume group
    #[serde(rename_all = "camelCase")]
    VolumeGroup {
        /// Logical volume group name
        vg_name: String,
        /// Extra vgcreate parameters
        #[serde(default)]
        parameters: Option<String>,
    },
}

/// Provisioner kind without its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionerKind {
    Filesystem,
    RawBlock,
    VolumeGroup,
}

impl ProvisionerKind {
    /// Whether the backend consumes the raw block device (no mount step)
    pub fn consumes_raw_device(&self) -> bool {
        !matches!(self, ProvisionerKind::Filesystem)
    }
}

impl std::fmt::Display for ProvisionerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionerKind::Filesystem => write!(f, "filesystem"),
            ProvisionerKind::RawBlock => write!(f, "raw-block"),
            ProvisionerKind::VolumeGroup => write!(f, "volume-group"),
        }
    }
}

impl ProvisionerSpec {
    pub fn kind(&self) -> ProvisionerKind {
        match self {
            ProvisionerSpec::Filesystem => ProvisionerKind::Filesystem,
            ProvisionerSpec::RawBlock { .. } => ProvisionerKind::RawBlock,
            ProvisionerSpec::VolumeGroup { .. } => ProvisionerKind::VolumeGroup,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a BlockDevice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    /// Liveness of the device on the node
    #[serde(default)]
    pub state: DeviceState,

    /// Position in the provisioning state machine
    #[serde(default)]
    pub provision_phase: ProvisionPhase,

    /// Hardware and filesystem details
    #[serde(default)]
    pub device_status: DeviceStatus,

    /// Sub-step conditions
    #[serde(default)]
    pub conditions: Vec<DeviceCondition>,

    /// Tags last written to the backend
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Liveness of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceState {
    #[default]
    Active,
    Inactive,
}

/// Provisioning phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ProvisionPhase {
    #[default]
    Unprovisioned,
    Partitioning,
    Partitioned,
    Formatting,
    Formatted,
    Mounting,
    Mounted,
    Unmounting,
    Provisioning,
    Provisioned,
    Unprovisioning,
    Failed,
}

impl ProvisionPhase {
    /// The in-flight condition guarding this phase, if it is transient
    pub fn in_flight_condition(&self) -> Option<ConditionType> {
        match self {
            ProvisionPhase::Partitioning => Some(ConditionType::Partitioning),
            ProvisionPhase::Formatting => Some(ConditionType::Formatting),
            ProvisionPhase::Mounting => Some(ConditionType::Mounting),
            ProvisionPhase::Unmounting => Some(ConditionType::Unmounting),
            ProvisionPhase::Provisioning => Some(ConditionType::Provisioning),
            ProvisionPhase::Unprovisioning => Some(ConditionType::Unprovisioning),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Hardware and filesystem details of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Kernel-assigned device path (may change across reboots)
    #[serde(default)]
    pub dev_path: String,

    /// Parent disk path (partitions only)
    #[serde(default)]
    pub parent_device: Option<String>,

    /// Whether the agent created the partition table on this disk
    #[serde(default)]
    pub partitioned: bool,

    /// PARTUUID of the partition the agent created on this disk
    #[serde(default)]
    pub child_part_uuid: String,

    #[serde(default)]
    pub capacity: DeviceCapacity,

    #[serde(default)]
    pub details: DeviceDetails,

    #[serde(default)]
    pub file_system: FilesystemStatus,
}

/// Capacity of a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapacity {
    /// Size in bytes
    #[serde(default)]
    pub size_bytes: u64,

    /// Physical block size in bytes
    #[serde(default)]
    pub physical_block_size_bytes: u64,
}

/// Hardware identity details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetails {
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub drive_type: DriveType,
    #[serde(default)]
    pub storage_controller: String,
    #[serde(default)]
    pub bus_path: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub wwn: String,
    #[serde(default)]
    pub ptable_uuid: String,
    #[serde(default)]
    pub fs_uuid: String,
    #[serde(default)]
    pub part_uuid: String,
    #[serde(default)]
    pub part_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub removable: bool,
}

/// Disk or partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Disk,
    Part,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Disk => write!(f, "disk"),
            DeviceType::Part => write!(f, "part"),
        }
    }
}

/// Physical drive type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DriveType {
    #[serde(rename = "HDD")]
    Hdd,
    #[serde(rename = "SSD")]
    Ssd,
    /// Floppy disk drive
    #[serde(rename = "FDD")]
    Fdd,
    /// Optical disk drive
    #[serde(rename = "ODD")]
    Odd,
    #[default]
    Unknown,
}

impl std::fmt::Display for DriveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveType::Hdd => write!(f, "HDD"),
            DriveType::Ssd => write!(f, "SSD"),
            DriveType::Fdd => write!(f, "FDD"),
            DriveType::Odd => write!(f, "ODD"),
            DriveType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Observed filesystem
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemStatus {
    #[serde(default)]
    pub mount_point: String,

    #[serde(default)]
    pub r#type: String,

    #[serde(default)]
    pub is_read_only: bool,

    /// Set when a mount reported a damaged filesystem
    #[serde(default)]
    pub corrupted: bool,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_formatted_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Conditions
// =============================================================================

/// Condition types tracking provisioning sub-steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    Partitioning,
    Partitioned,
    Formatting,
    Formatted,
    Mounting,
    Mounted,
    Unmounting,
    Provisioning,
    Provisioned,
    Unprovisioning,
    AddedToNode,
}

impl ConditionType {
    /// Conditions that mark an effect as currently executing
    pub const IN_FLIGHT: [ConditionType; 6] = [
        ConditionType::Partitioning,
        ConditionType::Formatting,
        ConditionType::Mounting,
        ConditionType::Unmounting,
        ConditionType::Provisioning,
        ConditionType::Unprovisioning,
    ];
}

/// A named boolean condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCondition {
    pub r#type: ConditionType,
    pub status: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Implementations
// =============================================================================

impl BlockDevice {
    /// The device GUID (record name)
    pub fn guid(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn status(&self) -> BlockDeviceStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut BlockDeviceStatus {
        self.status.get_or_insert_with(BlockDeviceStatus::default)
    }

    pub fn phase(&self) -> ProvisionPhase {
        self.status
            .as_ref()
            .map(|s| s.provision_phase)
            .unwrap_or_default()
    }

    pub fn state(&self) -> DeviceState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn device_type(&self) -> DeviceType {
        self.status
            .as_ref()
            .map(|s| s.device_status.details.device_type)
            .unwrap_or_default()
    }

    pub fn is_disk(&self) -> bool {
        self.device_type() == DeviceType::Disk
    }

    pub fn dev_path(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.device_status.dev_path.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.spec.dev_name)
    }

    pub fn desired_mount_point(&self) -> &str {
        &self.spec.file_system.mount_point
    }

    pub fn observed_mount_point(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.device_status.file_system.mount_point.as_str())
            .unwrap_or_default()
    }

    /// Selected backend kind, defaulting to the filesystem backend
    pub fn provisioner_kind(&self) -> ProvisionerKind {
        self.spec
            .provisioner
            .as_ref()
            .map(ProvisionerSpec::kind)
            .unwrap_or(ProvisionerKind::Filesystem)
    }

    /// Whether the operator asked for any filesystem or backend work
    pub fn has_intent(&self) -> bool {
        self.spec.file_system.force_formatted
            || !self.spec.file_system.mount_point.is_empty()
            || self.spec.provision
    }

    pub fn condition(&self, ty: ConditionType) -> Option<&DeviceCondition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == ty))
    }

    pub fn condition_true(&self, ty: ConditionType) -> bool {
        self.condition(ty).map(|c| c.status).unwrap_or(false)
    }

    /// True while any effect for this device is executing
    pub fn in_flight(&self) -> bool {
        ConditionType::IN_FLIGHT
            .iter()
            .any(|ty| self.condition_true(*ty))
    }

    /// Set a condition, bumping the transition time only on change
    pub fn set_condition(&mut self, ty: ConditionType, status: bool, message: impl Into<String>) {
        self.status_mut().set_condition(ty, status, message);
    }
}

impl BlockDeviceStatus {
    pub fn set_condition(&mut self, ty: ConditionType, status: bool, message: impl Into<String>) {
        let message = message.into();
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.r#type == ty) {
            if existing.status != status {
                existing.last_transition_time = Some(Utc::now());
            }
            existing.status = status;
            existing.message = message;
        } else {
            self.conditions.push(DeviceCondition {
                r#type: ty,
                status,
                message,
                last_transition_time: Some(Utc::now()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> BlockDevice {
        BlockDevice::new(
            "0123456789abcdef0123456789abcdef",
            BlockDeviceSpec {
                dev_name: "/dev/sdb".into(),
                node_name: "node-1".into(),
                file_system: FilesystemSpec::default(),
                provision: false,
                provisioner: None,
                tags: vec![],
            },
        )
    }

    #[test]
    fn test_defaults_without_status() {
        let dev = device();
        assert_eq!(dev.phase(), ProvisionPhase::Unprovisioned);
        assert_eq!(dev.state(), DeviceState::Active);
        assert_eq!(dev.dev_path(), "/dev/sdb");
        assert_eq!(dev.provisioner_kind(), ProvisionerKind::Filesystem);
        assert!(!dev.in_flight());
    }

    #[test]
    fn test_set_condition_replaces_existing() {
        let mut dev = device();
        dev.set_condition(ConditionType::Formatting, true, "");
        assert!(dev.in_flight());
        dev.set_condition(ConditionType::Formatting, false, "done");
        assert!(!dev.in_flight());
        assert_eq!(dev.status().conditions.len(), 1);
        assert_eq!(
            dev.condition(ConditionType::Formatting).map(|c| c.message.as_str()),
            Some("done")
        );
    }

    #[test]
    fn test_provisioner_spec_is_tagged() {
        let spec: ProvisionerSpec =
            serde_json::from_str(r#"{"kind":"volume-group","vgName":"vg0"}"#).unwrap();
        assert_eq!(
            spec,
            ProvisionerSpec::VolumeGroup {
                vg_name: "vg0".into(),
                parameters: None
            }
        );
        assert_eq!(spec.kind(), ProvisionerKind::VolumeGroup);
        assert!(spec.kind().consumes_raw_device());

        let json = serde_json::to_value(ProvisionerSpec::Filesystem).unwrap();
        assert_eq!(json["kind"], "filesystem");
    }

    #[test]
    fn test_phase_in_flight_conditions() {
        assert_eq!(
            ProvisionPhase::Formatting.in_flight_condition(),
            Some(ConditionType::Formatting)
        );
        assert_eq!(ProvisionPhase::Formatted.in_flight_condition(), None);
        assert_eq!(ProvisionPhase::Failed.in_flight_condition(), None);
    }
}
