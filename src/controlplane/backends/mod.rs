//! Storage Backend Provisioners
//!
//! Three interchangeable [`Provisioner`] implementations selected by the
//! device's `provisioner.kind`:
//! - filesystem: ext4 filesystem published as a Longhorn disk
//! - raw-block: raw device published as a Longhorn block disk
//! - volume-group: device added to an LVM volume group

pub mod longhorn;
pub mod longhorn_block;
pub mod lvm;
pub mod tags;

pub use longhorn::*;
pub use longhorn_block::*;
pub use lvm::*;
pub use tags::reconcile_tags;

use crate::controlplane::context::ProvisionerContext;
use crate::crd::{BlockDevice, DeviceState, ProvisionerKind, ProvisionerSpec};
use crate::domain::ports::Provisioner;
use crate::error::Result;
use crate::hardware::discovery::present;
use std::sync::Arc;

/// Factory for storage backend provisioners
pub struct BackendFactory;

impl BackendFactory {
    /// Provisioner selected by the device's spec
    pub fn for_device(ctx: &Arc<ProvisionerContext>, device: &BlockDevice) -> Arc<dyn Provisioner> {
        match &device.spec.provisioner {
            None | Some(ProvisionerSpec::Filesystem) => {
                Arc::new(LonghornProvisioner::new(ctx.clone()))
            }
            Some(ProvisionerSpec::RawBlock { disk_driver }) => {
                Arc::new(LonghornBlockProvisioner::new(ctx.clone(), disk_driver.clone()))
            }
            Some(ProvisionerSpec::VolumeGroup { vg_name, parameters }) => Arc::new(
                LvmProvisioner::new(ctx.clone(), vg_name.clone(), parameters.clone()),
            ),
        }
    }

    /// Provisioner of a given kind with default settings
    pub fn for_kind(ctx: &Arc<ProvisionerContext>, kind: ProvisionerKind) -> Option<Arc<dyn Provisioner>> {
        match kind {
            ProvisionerKind::Filesystem => Some(Arc::new(LonghornProvisioner::new(ctx.clone()))),
            ProvisionerKind::RawBlock => Some(Arc::new(LonghornBlockProvisioner::new(
                ctx.clone(),
                String::new(),
            ))),
            // A volume group provisioner needs a group name
            ProvisionerKind::VolumeGroup => None,
        }
    }
}

/// Stable path for handing a whole device to a backend
///
/// Disks prefer their bus topology path, then the WWN symlink. Everything
/// else goes through the persistent path resolver.
pub(crate) async fn block_device_path(ctx: &ProvisionerContext, device: &BlockDevice) -> Result<String> {
    let status = device.status();
    let details = &status.device_status.details;

    if device.is_disk() {
        if !details.bus_path.is_empty() {
            let candidate = format!("/dev/disk/by-path/{}", details.bus_path);
            if ctx.scanner.link_exists(&candidate) {
                return Ok(candidate);
            }
        }
        if present(&details.wwn) {
            let candidate = format!("/dev/disk/by-id/wwn-{}", details.wwn);
            if ctx.scanner.link_exists(&candidate) {
                return Ok(candidate);
            }
        }
    }

    ctx.scanner.resolve_persistent_path(&status.device_status).await
}

/// Devices that are gone or damaged skip replica eviction on unprovision
pub(crate) fn fast_path(device: &BlockDevice) -> bool {
    device.state() == DeviceState::Inactive
        || device
            .status
            .as_ref()
            .map(|s| s.device_status.file_system.corrupted)
            .unwrap_or(false)
}
