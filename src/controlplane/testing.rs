//! Test doubles for the control plane

use crate::controlplane::context::ProvisionerContext;
use crate::crd::{
    BlockDevice, BlockDeviceSpec, DeviceType, LonghornNode, LonghornNodeSpec, LvmVolumeGroup,
    LABEL_NODE,
};
use crate::domain::ports::{DiskOps, LvmOps, RecordStore};
use crate::error::{Error, Result};
use crate::hardware::discovery::scanner::tests::Fixture;
use crate::store::MemoryStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const NODE: &str = "node-1";

/// Records every disk and LVM command; failures are scripted per operation
#[derive(Debug, Default)]
pub(crate) struct RecordingOps {
    pub calls: Mutex<Vec<String>>,
    /// Operation name -> stderr of a scripted failure
    pub failures: Mutex<HashMap<String, String>>,
    pub physical_volumes: Mutex<HashSet<String>>,
    pub volume_groups: Mutex<BTreeMap<String, Vec<String>>>,
}

impl RecordingOps {
    pub fn fail(&self, op: &str, stderr: &str) {
        self.failures.lock().insert(op.to_string(), stderr.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, op: &str, call: String) -> Result<()> {
        self.calls.lock().push(call);
        match self.failures.lock().get(op) {
            Some(stderr) => Err(Error::command(op, stderr.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DiskOps for RecordingOps {
    async fn create_single_partition(&self, dev_path: &str, _part_uuid: &str) -> Result<()> {
        self.record("partition", format!("partition {}", dev_path))
    }

    async fn make_ext4(&self, dev_path: &str, uuid: Option<&str>) -> Result<()> {
        self.record(
            "mkfs",
            format!("mkfs {} {}", dev_path, uuid.unwrap_or_default()),
        )
    }

    async fn wipe_signatures(&self, dev_path: &str) -> Result<()> {
        self.record("wipe", format!("wipe {}", dev_path))
    }

    async fn mount(&self, dev_path: &str, mount_point: &str) -> Result<()> {
        self.record("mount", format!("mount {} {}", dev_path, mount_point))
    }

    async fn unmount(&self, mount_point: &str) -> Result<()> {
        self.record("umount", format!("umount {}", mount_point))
    }
}

#[async_trait]
impl LvmOps for RecordingOps {
    async fn is_physical_volume(&self, dev_path: &str) -> Result<bool> {
        Ok(self.physical_volumes.lock().contains(dev_path))
    }

    async fn volume_group_members(&self, vg_name: &str) -> Result<Option<Vec<String>>> {
        Ok(self.volume_groups.lock().get(vg_name).cloned())
    }

    async fn create_volume_group(
        &self,
        vg_name: &str,
        devices: &[String],
        _parameters: Option<&str>,
    ) -> Result<()> {
        self.record("vgcreate", format!("vgcreate {} {}", vg_name, devices.join(",")))?;
        self.volume_groups
            .lock()
            .insert(vg_name.to_string(), devices.to_vec());
        Ok(())
    }

    async fn extend_volume_group(&self, vg_name: &str, dev_path: &str) -> Result<()> {
        self.record("vgextend", format!("vgextend {} {}", vg_name, dev_path))?;
        if let Some(members) = self.volume_groups.lock().get_mut(vg_name) {
            members.push(dev_path.to_string());
        }
        Ok(())
    }

    async fn reduce_volume_group(&self, vg_name: &str, dev_path: &str) -> Result<()> {
        self.record("vgreduce", format!("vgreduce {} {}", vg_name, dev_path))?;
        if let Some(members) = self.volume_groups.lock().get_mut(vg_name) {
            members.retain(|m| m != dev_path);
        }
        Ok(())
    }

    async fn remove_volume_group(&self, vg_name: &str) -> Result<()> {
        self.record("vgremove", format!("vgremove {}", vg_name))?;
        self.volume_groups.lock().remove(vg_name);
        Ok(())
    }

    async fn activate_volume_group(&self, vg_name: &str, active: bool) -> Result<()> {
        self.record("vgchange", format!("vgchange {} {}", vg_name, active))
    }
}

/// Context wired to in-memory stores, recording tooling and a fake host
pub(crate) struct TestEnv {
    pub ctx: Arc<ProvisionerContext>,
    pub devices: Arc<MemoryStore<BlockDevice>>,
    pub nodes: Arc<MemoryStore<LonghornNode>>,
    pub groups: Arc<MemoryStore<LvmVolumeGroup>>,
    pub ops: Arc<RecordingOps>,
    pub fixture: Fixture,
}

impl TestEnv {
    pub fn new() -> Self {
        let fixture = Fixture::new();
        let devices = Arc::new(MemoryStore::new());
        let nodes = Arc::new(MemoryStore::new());
        let groups = Arc::new(MemoryStore::new());
        let ops = Arc::new(RecordingOps::default());
        let ctx = Arc::new(ProvisionerContext::new(
            NODE,
            devices.clone(),
            nodes.clone(),
            groups.clone(),
            ops.clone(),
            ops.clone(),
            fixture.scanner(),
            2,
            Duration::from_millis(10),
        ));
        Self {
            ctx,
            devices,
            nodes,
            groups,
            ops,
            fixture,
        }
    }

    /// Unsaved record for `/dev/<name>`
    pub fn device(&self, name: &str, device_type: DeviceType) -> BlockDevice {
        let mut dev = BlockDevice::new(
            &format!("guid-{}", name),
            BlockDeviceSpec {
                dev_name: format!("/dev/{}", name),
                node_name: NODE.into(),
                ..Default::default()
            },
        );
        dev.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_NODE.to_string(), NODE.to_string());
        let status = dev.status_mut();
        status.device_status.dev_path = format!("/dev/{}", name);
        status.device_status.details.device_type = device_type;
        dev
    }

    pub async fn save(&self, device: &BlockDevice) -> BlockDevice {
        self.devices.create(device).await.unwrap()
    }

    pub async fn longhorn_node(&self) -> LonghornNode {
        let node = LonghornNode::new(NODE, LonghornNodeSpec::default());
        self.nodes.create(&node).await.unwrap()
    }
}
