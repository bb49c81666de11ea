//! Provisioner Context
//!
//! State shared by the executor and every backend for the life of the
//! process: record stores, host tooling, the backend tag cache, the format
//! concurrency limit and the volume-group creation lock.

use crate::crd::{BlockDevice, LonghornNode, LvmVolumeGroup};
use crate::domain::ports::{DiskOps, LvmOps, RecordStore};
use crate::hardware::discovery::BlockScanner;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

/// Default number of concurrent filesystem formats
pub const DEFAULT_FORMAT_CONCURRENCY: usize = 5;

// =============================================================================
// Disk Tags Cache
// =============================================================================

/// Last tag set this agent pushed to the backend, per device GUID
///
/// Seeded once from the records' observed tags; afterwards entries are
/// only inserted or overwritten.
#[derive(Debug, Default)]
pub struct DiskTags {
    tags: RwLock<HashMap<String, Vec<String>>>,
    initialized: AtomicBool,
}

impl DiskTags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from existing records; only the first call has any effect
    pub fn initialize(&self, devices: &[BlockDevice]) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tags = self.tags.write();
        for device in devices {
            if let Some(status) = &device.status {
                if !status.tags.is_empty() {
                    tags.insert(device.guid().to_string(), status.tags.clone());
                }
            }
        }
        debug!("Disk tag cache seeded with {} devices", tags.len());
    }

    pub fn get(&self, guid: &str) -> Vec<String> {
        self.tags.read().get(guid).cloned().unwrap_or_default()
    }

    pub fn set(&self, guid: &str, tags: Vec<String>) {
        self.tags.write().insert(guid.to_string(), tags);
    }
}

// =============================================================================
// Context
// =============================================================================

/// Everything a provisioning effect needs
pub struct ProvisionerContext {
    pub node_name: String,
    pub devices: Arc<dyn RecordStore<BlockDevice>>,
    pub longhorn_nodes: Arc<dyn RecordStore<LonghornNode>>,
    pub volume_groups: Arc<dyn RecordStore<LvmVolumeGroup>>,
    pub disk_ops: Arc<dyn DiskOps>,
    pub lvm_ops: Arc<dyn LvmOps>,
    /// Kernel view used for persistent paths and mount checks
    pub scanner: BlockScanner,
    pub tags: DiskTags,
    /// Caps concurrent filesystem formats
    pub format_permits: Semaphore,
    /// Serializes volume-group record creation
    pub vg_lock: Mutex<()>,
    /// Delay before a not-ready step is retried
    pub requeue_delay: Duration,
}

impl ProvisionerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl Into<String>,
        devices: Arc<dyn RecordStore<BlockDevice>>,
        longhorn_nodes: Arc<dyn RecordStore<LonghornNode>>,
        volume_groups: Arc<dyn RecordStore<LvmVolumeGroup>>,
        disk_ops: Arc<dyn DiskOps>,
        lvm_ops: Arc<dyn LvmOps>,
        scanner: BlockScanner,
        format_concurrency: usize,
        requeue_delay: Duration,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            devices,
            longhorn_nodes,
            volume_groups,
            disk_ops,
            lvm_ops,
            scanner,
            tags: DiskTags::new(),
            format_permits: Semaphore::new(format_concurrency.max(1)),
            vg_lock: Mutex::new(()),
            requeue_delay,
        }
    }
}
