//! Longhorn Raw-Block Backend
//!
//! Longhorn consumes the whole device directly, so format only wipes old
//! signatures and provision publishes a stable bus path as a block disk.

use super::longhorn::{add_disk, detach, disk_path, sync_tags};
use super::{block_device_path, fast_path};
use crate::controlplane::context::ProvisionerContext;
use crate::crd::{BlockDevice, LonghornDiskSpec, LonghornDiskType, ProvisionerKind};
use crate::domain::ports::{FormatOutcome, Provisioner};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

const DEFAULT_DISK_DRIVER: &str = "auto";

/// Raw-block Longhorn provisioner
pub struct LonghornBlockProvisioner {
    ctx: Arc<ProvisionerContext>,
    disk_driver: String,
}

impl LonghornBlockProvisioner {
    pub fn new(ctx: Arc<ProvisionerContext>, disk_driver: String) -> Self {
        Self { ctx, disk_driver }
    }

    fn disk_driver(&self) -> &str {
        if self.disk_driver.is_empty() {
            DEFAULT_DISK_DRIVER
        } else {
            &self.disk_driver
        }
    }
}

#[async_trait]
impl Provisioner for LonghornBlockProvisioner {
    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::RawBlock
    }

    async fn format(&self, device: &BlockDevice, dev_path: &str) -> Result<FormatOutcome> {
        let mount_point = device.observed_mount_point();
        if !mount_point.is_empty() {
            return Err(Error::BackendOperationFailed {
                backend: "longhorn-block".into(),
                operation: "format".into(),
                reason: format!("{} is mounted at {}", dev_path, mount_point),
            });
        }

        info!("Wiping signatures on {} ({})", device.guid(), dev_path);
        self.ctx.disk_ops.wipe_signatures(dev_path).await?;
        Ok(FormatOutcome {
            formatted: true,
            requeue: false,
        })
    }

    async fn unformat(&self, _device: &BlockDevice) -> Result<bool> {
        Ok(false)
    }

    async fn provision(&self, device: &BlockDevice) -> Result<bool> {
        let path = block_device_path(&self.ctx, device).await?;
        let entry = LonghornDiskSpec {
            path,
            disk_type: LonghornDiskType::Block,
            disk_driver: self.disk_driver().to_string(),
            ..Default::default()
        };
        add_disk(&self.ctx, device, entry).await
    }

    async fn unprovision(&self, device: &BlockDevice) -> Result<bool> {
        detach(&self.ctx, device, fast_path(device)).await
    }

    async fn update(&self, device: &BlockDevice) -> Result<bool> {
        sync_tags(&self.ctx, device).await
    }

    async fn backend_path(&self, device: &BlockDevice) -> Result<Option<String>> {
        disk_path(&self.ctx, device).await
    }
}
