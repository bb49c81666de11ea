//! Domain Ports - Core trait definitions for the node disk agent
//!
//! These traits define the boundaries between the provisioning core and the
//! outside world: the record store, the kernel, the disk tooling and the
//! storage backends. Adapters implement them; tests substitute fakes.

use crate::crd::{BlockDevice, ProvisionerKind};
use crate::error::Result;
use crate::hardware::discovery::DiskInfo;
use crate::hardware::monitor::Uevent;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;

// =============================================================================
// Record Store Port
// =============================================================================

/// Equality-based label selector
pub type LabelSelector = BTreeMap<String, String>;

/// A versioned object store holding one record kind
///
/// `update` must reject a write whose resource version is stale with
/// [`crate::Error::Conflict`].
#[async_trait]
pub trait RecordStore<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Fetch a record by name
    async fn get(&self, name: &str) -> Result<Option<K>>;

    /// List records matching every label in the selector
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>>;

    /// Create a record; fails if the name is taken
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace a record (spec, metadata and status) with a version check
    async fn update(&self, obj: &K) -> Result<K>;

    /// Delete a record by name
    async fn delete(&self, name: &str) -> Result<()>;

    /// Stream that yields whenever any record of this kind changes
    fn changes(&self) -> BoxStream<'static, ()>;
}

// =============================================================================
// Kernel Device Port
// =============================================================================

/// Source of block device topology
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Enumerate every non-loopback disk with its partitions
    async fn scan(&self) -> Result<Vec<DiskInfo>>;

    /// Look up a single disk by kernel name (e.g. "sdb"); partitions resolve
    /// to their parent disk
    async fn disk(&self, name: &str) -> Result<Option<DiskInfo>>;
}

/// Source of kernel hot-plug events
#[async_trait]
pub trait UeventSource: Send {
    /// Wait for the next event
    async fn next_event(&mut self) -> Result<Uevent>;
}

// =============================================================================
// Disk Tooling Ports
// =============================================================================

/// Partition, filesystem and mount operations
#[async_trait]
pub trait DiskOps: Send + Sync {
    /// Replace the partition table with a GPT holding one full-size
    /// partition whose PARTUUID is `part_uuid`
    async fn create_single_partition(&self, dev_path: &str, part_uuid: &str) -> Result<()>;

    /// Create an ext4 filesystem, reusing `uuid` when given
    async fn make_ext4(&self, dev_path: &str, uuid: Option<&str>) -> Result<()>;

    /// Remove every filesystem / partition-table signature
    async fn wipe_signatures(&self, dev_path: &str) -> Result<()>;

    async fn mount(&self, dev_path: &str, mount_point: &str) -> Result<()>;

    async fn unmount(&self, mount_point: &str) -> Result<()>;
}

/// LVM operations
#[async_trait]
pub trait LvmOps: Send + Sync {
    /// Whether the device is already an LVM physical volume
    async fn is_physical_volume(&self, dev_path: &str) -> Result<bool>;

    /// Physical volumes of a group, or `None` if the group does not exist
    async fn volume_group_members(&self, vg_name: &str) -> Result<Option<Vec<String>>>;

    async fn create_volume_group(
        &self,
        vg_name: &str,
        devices: &[String],
        parameters: Option<&str>,
    ) -> Result<()>;

    async fn extend_volume_group(&self, vg_name: &str, dev_path: &str) -> Result<()>;

    async fn reduce_volume_group(&self, vg_name: &str, dev_path: &str) -> Result<()>;

    async fn remove_volume_group(&self, vg_name: &str) -> Result<()>;

    async fn activate_volume_group(&self, vg_name: &str, active: bool) -> Result<()>;
}

// =============================================================================
// Storage Provisioner Port
// =============================================================================

/// Result of a backend format step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOutcome {
    /// The device was (re)written
    pub formatted: bool,
    /// Try again later; not an error
    pub requeue: bool,
}

/// A storage backend that block devices can be attached to
///
/// Every method returning `bool` returns the requeue flag: `true` means the
/// backend is not ready yet and the caller should retry after a delay.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn kind(&self) -> ProvisionerKind;

    /// Prepare the device for the backend
    async fn format(&self, device: &BlockDevice, dev_path: &str) -> Result<FormatOutcome>;

    /// Release whatever `format` left in use on the host
    async fn unformat(&self, device: &BlockDevice) -> Result<bool>;

    /// Attach the device to the backend
    async fn provision(&self, device: &BlockDevice) -> Result<bool>;

    /// Detach the device from the backend; a device the backend does not
    /// know is a no-op success
    async fn unprovision(&self, device: &BlockDevice) -> Result<bool>;

    /// Push spec changes (tags) to the backend
    async fn update(&self, device: &BlockDevice) -> Result<bool>;

    /// Path the backend currently records for the device, if any
    async fn backend_path(&self, device: &BlockDevice) -> Result<Option<String>>;
}
