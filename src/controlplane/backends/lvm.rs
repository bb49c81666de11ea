//! LVM Volume Group Backend
//!
//! Devices join a volume group through an `LvmVolumeGroup` record; the
//! [`VolumeGroupReconciler`] turns the record's device set into `vgcreate`,
//! `vgextend` and `vgreduce` calls and reports the group status back. The
//! record name is generated, so creation is serialized under the context's
//! volume-group lock to keep one record per `(node, vg_name)`.

use super::block_device_path;
use crate::controlplane::context::ProvisionerContext;
use crate::controlplane::retry::update_with_retry;
use crate::crd::{
    generate_vg_record_name, BlockDevice, LvmVolumeGroup, LvmVolumeGroupSpec,
    LvmVolumeGroupStatus, ProvisionerKind, VgDesiredState, VgStatus, LABEL_NODE, LABEL_VG_NAME,
};
use crate::domain::ports::{FormatOutcome, LabelSelector, Provisioner};
use crate::error::Result;
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONDITION_READY: &str = "VgReady";
const CONDITION_DEVICES: &str = "DevicesAdded";

fn group_selector(node: &str, vg_name: Option<&str>) -> LabelSelector {
    let mut selector = BTreeMap::new();
    selector.insert(LABEL_NODE.to_string(), node.to_string());
    if let Some(vg_name) = vg_name {
        selector.insert(LABEL_VG_NAME.to_string(), vg_name.to_string());
    }
    selector
}

// =============================================================================
// Provisioner
// =============================================================================

/// Volume-group provisioner
pub struct LvmProvisioner {
    ctx: Arc<ProvisionerContext>,
    vg_name: String,
    parameters: Option<String>,
}

impl LvmProvisioner {
    pub fn new(ctx: Arc<ProvisionerContext>, vg_name: String, parameters: Option<String>) -> Self {
        Self {
            ctx,
            vg_name,
            parameters,
        }
    }

    async fn find_group(&self) -> Result<Option<LvmVolumeGroup>> {
        let selector = group_selector(&self.ctx.node_name, Some(&self.vg_name));
        Ok(self
            .ctx
            .volume_groups
            .list(&selector)
            .await?
            .into_iter()
            .find(|g| g.spec.vg_name == self.vg_name && g.spec.node_name == self.ctx.node_name))
    }

    fn new_group(&self, guid: &str, path: &str) -> LvmVolumeGroup {
        let mut devices = BTreeMap::new();
        devices.insert(guid.to_string(), path.to_string());
        let mut group = LvmVolumeGroup::new(
            &generate_vg_record_name(&self.vg_name),
            LvmVolumeGroupSpec {
                node_name: self.ctx.node_name.clone(),
                vg_name: self.vg_name.clone(),
                devices,
                desired_state: VgDesiredState::Enabled,
                parameters: self.parameters.clone(),
            },
        );
        group.metadata.labels = Some(group_selector(&self.ctx.node_name, Some(&self.vg_name)));
        group
    }
}

#[async_trait]
impl Provisioner for LvmProvisioner {
    fn kind(&self) -> ProvisionerKind {
        ProvisionerKind::VolumeGroup
    }

    async fn format(&self, device: &BlockDevice, dev_path: &str) -> Result<FormatOutcome> {
        if self.ctx.lvm_ops.is_physical_volume(dev_path).await? {
            debug!("{} is already a physical volume", dev_path);
            return Ok(FormatOutcome::default());
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
        let guid = device.guid();
        let path = block_device_path(&self.ctx, device).await?;

        let group = {
            let _guard = self.ctx.vg_lock.lock().await;
            match self.find_group().await? {
                Some(group) if group.spec.devices.get(guid) == Some(&path) => group,
                Some(group) => {
                    info!("Adding {} to volume group {}", guid, self.vg_name);
                    update_with_retry(self.ctx.volume_groups.as_ref(), &group.name_any(), |vg| {
                        vg.spec.devices.insert(guid.to_string(), path.clone());
                    })
                    .await?
                }
                None => {
                    info!("Creating volume group record for {} with {}", self.vg_name, guid);
                    self.ctx
                        .volume_groups
                        .create(&self.new_group(guid, &path))
                        .await?
                }
            }
        };

        let ready = group.vg_status() == VgStatus::Active
            && group
                .status
                .as_ref()
                .map(|s| s.devices.contains_key(guid))
                .unwrap_or(false);
        if !ready {
            debug!("Volume group {} not ready for {}", self.vg_name, guid);
        }
        Ok(!ready)
    }

    async fn unprovision(&self, device: &BlockDevice) -> Result<bool> {
        let guid = device.guid();
        let _guard = self.ctx.vg_lock.lock().await;

        let Some(group) = self.find_group().await? else {
            return Ok(false);
        };
        let Some(path) = group.spec.devices.get(guid).cloned() else {
            return Ok(false);
        };

        let lvm = &self.ctx.lvm_ops;
        if let Some(members) = lvm.volume_group_members(&self.vg_name).await? {
            let canonical = self.ctx.scanner.canonical_dev_path(&path);
            if members.contains(&canonical) {
                if members.len() == 1 {
                    info!("Removing volume group {} with its last member", self.vg_name);
                    lvm.remove_volume_group(&self.vg_name).await?;
                } else {
                    lvm.reduce_volume_group(&self.vg_name, &canonical).await?;
                }
            }
        }

        let name = group.name_any();
        if group.spec.devices.len() == 1 {
            info!("Deleting empty volume group record {}", name);
            self.ctx.volume_groups.delete(&name).await?;
        } else {
            update_with_retry(self.ctx.volume_groups.as_ref(), &name, |vg| {
                vg.spec.devices.remove(guid);
            })
            .await?;
        }
        Ok(false)
    }

    async fn update(&self, _device: &BlockDevice) -> Result<bool> {
        Ok(false)
    }

    async fn backend_path(&self, device: &BlockDevice) -> Result<Option<String>> {
        Ok(self
            .find_group()
            .await?
            .filter(|g| g.spec.devices.contains_key(device.guid()))
            .map(|g| g.spec.vg_name))
    }
}

// =============================================================================
// Volume Group Reconciler
// =============================================================================

/// Converges this node's volume groups on their records
pub struct VolumeGroupReconciler {
    ctx: Arc<ProvisionerContext>,
}

impl VolumeGroupReconciler {
    pub fn new(ctx: Arc<ProvisionerContext>) -> Self {
        Self { ctx }
    }

    /// Reconcile every group record of this node; one failing group does
    /// not stop the others
    pub async fn reconcile_node(&self) -> Result<()> {
        let selector = group_selector(&self.ctx.node_name, None);
        let groups = self.ctx.volume_groups.list(&selector).await?;
        for group in groups {
            if let Err(e) = self.reconcile(&group).await {
                warn!("Volume group {} reconcile failed: {}", group.spec.vg_name, e);
                self.record_error(&group, &e.to_string()).await;
            }
        }
        Ok(())
    }

    async fn reconcile(&self, group: &LvmVolumeGroup) -> Result<()> {
        let _guard = self.ctx.vg_lock.lock().await;
        let lvm = &self.ctx.lvm_ops;
        let vg_name = &group.spec.vg_name;
        let enabled = group.spec.desired_state == VgDesiredState::Enabled;

        let desired: BTreeMap<&String, String> = group
            .spec
            .devices
            .iter()
            .map(|(guid, path)| (guid, self.ctx.scanner.canonical_dev_path(path)))
            .collect();

        let mut members = lvm.volume_group_members(vg_name).await?;
        if members.is_none() && enabled && !desired.is_empty() {
            let devices: Vec<String> = desired.values().cloned().collect();
            info!("Creating volume group {} on {:?}", vg_name, devices);
            lvm.create_volume_group(vg_name, &devices, group.spec.parameters.as_deref())
                .await?;
            members = Some(devices);
        }

        let status = match members {
            None => LvmVolumeGroupStatus {
                status: if enabled {
                    VgStatus::Unknown
                } else {
                    VgStatus::Inactive
                },
                ..Default::default()
            },
            Some(mut members) => {
                for path in desired.values() {
                    if !members.contains(path) {
                        info!("Extending volume group {} with {}", vg_name, path);
                        lvm.extend_volume_group(vg_name, path).await?;
                        members.push(path.clone());
                    }
                }

                // Only members this agent added are reduced
                let previous = group.status.as_ref().map(|s| s.devices.clone()).unwrap_or_default();
                for (guid, path) in &previous {
                    if group.spec.devices.contains_key(guid) {
                        continue;
                    }
                    let canonical = self.ctx.scanner.canonical_dev_path(path);
                    if members.contains(&canonical) && members.len() > 1 {
                        info!("Reducing volume group {} by {}", vg_name, canonical);
                        lvm.reduce_volume_group(vg_name, &canonical).await?;
                        members.retain(|m| m != &canonical);
                    }
                }

                lvm.activate_volume_group(vg_name, enabled).await?;

                let devices = group
                    .spec
                    .devices
                    .iter()
                    .filter(|(guid, _)| desired.get(guid).map(|p| members.contains(p)).unwrap_or(false))
                    .map(|(guid, path)| (guid.clone(), path.clone()))
                    .collect();
                LvmVolumeGroupStatus {
                    status: if enabled {
                        VgStatus::Active
                    } else {
                        VgStatus::Inactive
                    },
                    devices,
                    conditions: group.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default(),
                }
            }
        };

        let mut next = group.clone();
        let all_added = status.devices.len() == group.spec.devices.len();
        let ready = status.status == VgStatus::Active;
        next.status = Some(status);
        next.set_condition(CONDITION_READY, ready, "");
        next.set_condition(
            CONDITION_DEVICES,
            all_added,
            if all_added { "" } else { "waiting for devices" },
        );

        if next.status != group.status {
            let status = next.status.clone();
            update_with_retry(self.ctx.volume_groups.as_ref(), &group.name_any(), |vg| {
                vg.status = status.clone();
            })
            .await?;
            debug!("Volume group {} status updated", vg_name);
        }
        Ok(())
    }

    async fn record_error(&self, group: &LvmVolumeGroup, message: &str) {
        let result = update_with_retry(self.ctx.volume_groups.as_ref(), &group.name_any(), |vg| {
            vg.status.get_or_insert_with(LvmVolumeGroupStatus::default).status = VgStatus::Unknown;
            vg.set_condition(CONDITION_READY, false, message);
        })
        .await;
        if let Err(e) = result {
            warn!("Failed to record volume group error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::TestEnv;
    use crate::crd::DeviceType;
    use crate::domain::ports::RecordStore;
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn vg_disk(env: &TestEnv, name: &str) -> BlockDevice {
        let mut dev = env.device(name, DeviceType::Disk);
        dev.spec.provision = true;
        let wwn = format!("0x{}", name);
        dev.status_mut().device_status.details.wwn = wwn.clone();
        env.fixture.link(&format!("/dev/disk/by-id/wwn-{}", wwn));
        dev
    }

    fn provisioner(env: &TestEnv) -> LvmProvisioner {
        LvmProvisioner::new(env.ctx.clone(), "vg0".into(), None)
    }

    #[tokio::test]
    async fn test_format_skips_existing_pv() {
        let env = TestEnv::new();
        let dev = vg_disk(&env, "sdb");
        env.ops.physical_volumes.lock().insert("/dev/sdb".into());

        let outcome = provisioner(&env).format(&dev, "/dev/sdb").await.unwrap();
        assert!(!outcome.formatted);
        assert!(env.ops.calls().is_empty());

        let outcome = provisioner(&env).format(&dev, "/dev/sdc").await.unwrap();
        assert!(outcome.formatted);
        assert_eq!(env.ops.calls(), vec!["wipe /dev/sdc"]);
    }

    #[tokio::test]
    async fn test_provision_creates_one_record_and_waits_for_active() {
        let env = TestEnv::new();
        let a = vg_disk(&env, "sdb");
        let b = vg_disk(&env, "sdc");
        let provisioner = provisioner(&env);

        assert!(provisioner.provision(&a).await.unwrap());
        assert!(provisioner.provision(&b).await.unwrap());

        let groups = env.groups.all();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].spec.devices.len(), 2);
        assert_eq!(
            groups[0].spec.devices.get("guid-sdb").map(String::as_str),
            Some("/dev/disk/by-id/wwn-0xsdb")
        );

        VolumeGroupReconciler::new(env.ctx.clone())
            .reconcile_node()
            .await
            .unwrap();

        assert!(!provisioner.provision(&a).await.unwrap());
        assert_eq!(
            provisioner.backend_path(&a).await.unwrap().as_deref(),
            Some("vg0")
        );
        assert_eq!(
            env.ops.volume_groups.lock().get("vg0").map(Vec::len),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_unprovision_reduces_then_removes() {
        let env = TestEnv::new();
        let a = vg_disk(&env, "sdb");
        let b = vg_disk(&env, "sdc");
        let provisioner = provisioner(&env);
        provisioner.provision(&a).await.unwrap();
        provisioner.provision(&b).await.unwrap();
        VolumeGroupReconciler::new(env.ctx.clone())
            .reconcile_node()
            .await
            .unwrap();

        assert!(!provisioner.unprovision(&a).await.unwrap());
        assert_eq!(env.groups.all()[0].spec.devices.len(), 1);
        assert!(env
            .ops
            .calls()
            .contains(&"vgreduce vg0 /dev/disk/by-id/wwn-0xsdb".to_string()));

        assert!(!provisioner.unprovision(&b).await.unwrap());
        assert!(env.groups.all().is_empty());
        assert!(env.ops.volume_groups.lock().get("vg0").is_none());

        // Unknown device is a no-op
        assert!(!provisioner.unprovision(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconciler_disables_group() {
        let env = TestEnv::new();
        let a = vg_disk(&env, "sdb");
        provisioner(&env).provision(&a).await.unwrap();
        let reconciler = VolumeGroupReconciler::new(env.ctx.clone());
        reconciler.reconcile_node().await.unwrap();

        let mut group = env.groups.all().remove(0);
        group.spec.desired_state = VgDesiredState::Disabled;
        env.groups.update(&group).await.unwrap();
        reconciler.reconcile_node().await.unwrap();

        let group = env.groups.all().remove(0);
        assert_eq!(group.vg_status(), VgStatus::Inactive);
        assert!(env.ops.calls().contains(&"vgchange vg0 false".to_string()));
    }

    #[tokio::test]
    async fn test_reconciler_records_failures() {
        let env = TestEnv::new();
        let a = vg_disk(&env, "sdb");
        provisioner(&env).provision(&a).await.unwrap();
        env.ops.fail("vgcreate", "Device /dev/sdb excluded by a filter");

        VolumeGroupReconciler::new(env.ctx.clone())
            .reconcile_node()
            .await
            .unwrap();

        let group = env.groups.all().remove(0);
        assert_eq!(group.vg_status(), VgStatus::Unknown);
        let status = group.status.unwrap();
        let ready = status
            .conditions
            .iter()
            .find(|c| c.r#type == CONDITION_READY)
            .unwrap();
        assert!(!ready.status);
        assert!(ready.message.contains("excluded by a filter"));
    }

    #[tokio::test]
    async fn test_provision_needs_stable_path() {
        let env = TestEnv::new();
        let dev = env.device("sdd", DeviceType::Disk);
        assert_matches!(
            provisioner(&env).provision(&dev).await,
            Err(Error::NoPersistentPath { .. })
        );
    }
}
