//! Longhorn Filesystem Backend
//!
//! Formats the device as ext4, and once it is mounted publishes the mount
//! point as a filesystem disk in Longhorn's per-node disk map. The disk
//! entry is keyed by the device GUID.
//!
//! The disk-map helpers at the bottom are shared with the raw-block
//! backend.

use super::{fast_path, reconcile_tags};
use crate::controlplane::context::ProvisionerContext;
use crate::controlplane::retry::update_with_retry;
use crate::crd::{BlockDevice, LonghornDiskSpec, LonghornDiskType, ProvisionerKind};
use crate::domain::ports::{FormatOutcome, Provisioner};
use crate::error::{Error, Result};
use crate::hardware::discovery::present;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Filesystem-based Longhorn provisioner
pub struct LonghornProvisioner {
    ctx: Arc<ProvisionerContext>,
}

impl LonghornProvisioner {
    pub fn new(ctx: Arc<ProvisionerContext>) -> Self {
        Self { ctx }
    }

    async fn unmount_observed(&self, device: &BlockDevice) -> Result<()> {
        let mount_point = device.observed_mount_point();
        if !mount_point.is_empty() {
            debug!("Unmounting {} from {}", device.guid(), mount_point);
            self.ctx.disk_ops.unmount(mount_point).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for LonghornProvisioner {
    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::Filesystem
    }

    async fn format(&self, device: &BlockDevice, dev_path: &str) -> Result<FormatOutcome> {
        let status = device.status();
        let fs = &status.device_status.file_system;
        if fs.last_formatted_at.is_some() && !fs.corrupted {
            debug!("{} already formatted, skipping mkfs", device.guid());
            return Ok(FormatOutcome::default());
        }

        let _permit = self
            .ctx
            .format_permits
            .acquire()
            .await
            .map_err(|e| Error::Internal(format!("Format semaphore closed: {}", e)))?;

        self.unmount_observed(device).await?;

        // Reuse the previous filesystem UUID so by-uuid paths survive a reformat
        let prior = &status.device_status.details.fs_uuid;
        let fs_uuid = if present(prior) {
            prior.clone()
        } else {
            Uuid::new_v4().to_string()
        };

        info!("Formatting {} ({}) as ext4", device.guid(), dev_path);
        self.ctx.disk_ops.make_ext4(dev_path, Some(&fs_uuid)).await?;

        Ok(FormatOutcome {
            formatted: true,
            requeue: false,
        })
    }

    async fn unformat(&self, device: &BlockDevice) -> Result<bool> {
        self.unmount_observed(device).await?;
        Ok(false)
    }

    async fn provision(&self, device: &BlockDevice) -> Result<bool> {
        let mount_point = device.desired_mount_point();
        if mount_point.is_empty() {
            return Err(Error::BackendOperationFailed {
                backend: "longhorn".into(),
                operation: "provision".into(),
                reason: "device has no mount point".into(),
            });
        }

        let entry = LonghornDiskSpec {
            path: mount_point.to_string(),
            disk_type: LonghornDiskType::Filesystem,
            ..Default::default()
        };
        add_disk(&self.ctx, device, entry).await
    }

    async fn unprovision(&self, device: &BlockDevice) -> Result<bool> {
        let fast = fast_path(device);
        let requeue = detach(&self.ctx, device, fast).await?;
        if !requeue && fast {
            self.unmount_observed(device).await?;
        }
        Ok(requeue)
    }

    async fn update(&self, device: &BlockDevice) -> Result<bool> {
        sync_tags(&self.ctx, device).await
    }

    async fn backend_path(&self, device: &BlockDevice) -> Result<Option<String>> {
        disk_path(&self.ctx, device).await
    }
}

// =============================================================================
// Longhorn disk map helpers
// =============================================================================

/// Add or refresh the device's disk entry; requeues while the node record
/// does not exist yet
pub(crate) async fn add_disk(
    ctx: &ProvisionerContext,
    device: &BlockDevice,
    entry: LonghornDiskSpec,
) -> Result<bool> {
    if ctx.longhorn_nodes.get(&ctx.node_name).await?.is_none() {
        debug!("Longhorn node {} not found, requeueing", ctx.node_name);
        return Ok(true);
    }

    let guid = device.guid();
    let desired = device.spec.tags.clone();
    let cache = ctx.tags.get(guid);

    update_with_retry(ctx.longhorn_nodes.as_ref(), &ctx.node_name, |node| {
        let disk = node
            .spec
            .disks
            .entry(guid.to_string())
            .or_insert_with(|| entry.clone());
        disk.path = entry.path.clone();
        disk.disk_type = entry.disk_type;
        disk.disk_driver = entry.disk_driver.clone();
        disk.allow_scheduling = true;
        disk.eviction_requested = false;
        disk.tags = reconcile_tags(&desired, &disk.tags, &cache);
    })
    .await?;

    ctx.tags.set(guid, desired);
    info!("Added {} to Longhorn node {} at {}", guid, ctx.node_name, entry.path);
    Ok(false)
}

/// Remove the device's disk entry
///
/// Outside the fast path, scheduling is disabled and eviction requested
/// first; the entry is removed once no replica is left on the disk.
pub(crate) async fn detach(ctx: &ProvisionerContext, device: &BlockDevice, fast: bool) -> Result<bool> {
    let guid = device.guid();
    let Some(node) = ctx.longhorn_nodes.get(&ctx.node_name).await? else {
        return Ok(false);
    };
    let Some(disk) = node.disk(guid) else {
        debug!("{} not on Longhorn node {}, nothing to remove", guid, ctx.node_name);
        return Ok(false);
    };

    if !fast {
        if disk.allow_scheduling || !disk.eviction_requested {
            update_with_retry(ctx.longhorn_nodes.as_ref(), &ctx.node_name, |node| {
                if let Some(disk) = node.spec.disks.get_mut(guid) {
                    disk.allow_scheduling = false;
                    disk.eviction_requested = true;
                }
            })
            .await?;
            info!("Requested replica eviction from {}", guid);
            return Ok(true);
        }

        let replicas = node.scheduled_replicas(guid);
        if replicas > 0 {
            debug!("{} still holds {} replicas", guid, replicas);
            return Ok(true);
        }
    }

    update_with_retry(ctx.longhorn_nodes.as_ref(), &ctx.node_name, |node| {
        node.spec.disks.remove(guid);
    })
    .await?;
    info!("Removed {} from Longhorn node {}", guid, ctx.node_name);
    Ok(false)
}

/// Push the desired tags to the disk entry without dropping tags this agent
/// never wrote
pub(crate) async fn sync_tags(ctx: &ProvisionerContext, device: &BlockDevice) -> Result<bool> {
    let guid = device.guid();
    let Some(node) = ctx.longhorn_nodes.get(&ctx.node_name).await? else {
        return Ok(true);
    };
    if node.disk(guid).is_none() {
        debug!("{} has no Longhorn disk entry, skipping tag sync", guid);
        return Ok(false);
    }

    let desired = device.spec.tags.clone();
    let cache = ctx.tags.get(guid);
    update_with_retry(ctx.longhorn_nodes.as_ref(), &ctx.node_name, |node| {
        if let Some(disk) = node.spec.disks.get_mut(guid) {
            disk.tags = reconcile_tags(&desired, &disk.tags, &cache);
        }
    })
    .await?;

    ctx.tags.set(guid, desired);
    Ok(false)
}

/// Path recorded in the device's disk entry
pub(crate) async fn disk_path(ctx: &ProvisionerContext, device: &BlockDevice) -> Result<Option<String>> {
    Ok(ctx
        .longhorn_nodes
        .get(&ctx.node_name)
        .await?
        .and_then(|node| node.disk(device.guid()).map(|d| d.path.clone())))
}
