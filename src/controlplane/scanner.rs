//! Device Scanner
//!
//! The single reconciliation loop of the agent. Each pass:
//! 1. enumerates disks and partitions from the kernel
//! 2. drops excluded devices, duplicate WWNs and devices without identity
//! 3. creates records for new devices and refreshes observed status
//! 4. marks records whose device disappeared `Inactive`
//! 5. runs the state machine over every record and dispatches effects
//! 6. reconciles this node's volume groups
//!
//! Passes are triggered by the scan interval, the hot-plug monitor and the
//! record change feed, all through one coalescing [`Waker`].

use crate::controlplane::backends::{BackendFactory, VolumeGroupReconciler};
use crate::controlplane::context::ProvisionerContext;
use crate::controlplane::executor::EffectExecutor;
use crate::controlplane::metrics::AgentMetrics;
use crate::controlplane::retry::update_with_retry;
use crate::controlplane::state_machine::{next, ChildPartition, Observed};
use crate::controlplane::waker::Waker;
use crate::crd::{
    BlockDevice, BlockDeviceSpec, BlockDeviceStatus, ConditionType, DeviceState, DeviceStatus,
    ProvisionPhase, ProvisionerSpec, LABEL_DEVICE_TYPE, LABEL_NODE,
};
use crate::domain::ports::{DeviceSource, LabelSelector, RecordStore};
use crate::error::{Error, Result};
use crate::hardware::discovery::{disk_guid, partition_guid, present, DiskInfo, PartitionInfo};
use crate::hardware::filter::FilterSet;
use futures::stream::{BoxStream, StreamExt};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default interval between periodic scans
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Scanner behavior knobs
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub scan_interval: Duration,
    /// Auto-provisioned disks are mounted at `<mount_root>/<guid>`
    pub mount_root: String,
    /// Backend assigned to auto-provisioned disks
    pub default_provisioner: ProvisionerSpec,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            mount_root: "/var/lib/node-disk-agent/disks".to_string(),
            default_provisioner: ProvisionerSpec::Filesystem,
        }
    }
}

/// Records known for this node, keyed by GUID
type RecordMap = HashMap<String, BlockDevice>;

pub struct Scanner {
    ctx: Arc<ProvisionerContext>,
    source: Arc<dyn DeviceSource>,
    filters: FilterSet,
    executor: EffectExecutor,
    reconciler: VolumeGroupReconciler,
    waker: Waker,
    metrics: Arc<AgentMetrics>,
    settings: ScannerSettings,
}

impl Scanner {
    pub fn new(
        ctx: Arc<ProvisionerContext>,
        source: Arc<dyn DeviceSource>,
        filters: FilterSet,
        executor: EffectExecutor,
        waker: Waker,
        metrics: Arc<AgentMetrics>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            reconciler: VolumeGroupReconciler::new(ctx.clone()),
            ctx,
            source,
            filters,
            executor,
            waker,
            metrics,
            settings,
        }
    }

    fn node_selector(&self) -> LabelSelector {
        let mut selector = BTreeMap::new();
        selector.insert(LABEL_NODE.to_string(), self.ctx.node_name.clone());
        selector
    }

    // =========================================================================
    // Loop
    // =========================================================================

    /// Scan until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Scanner started on node {}", self.ctx.node_name);
        if let Err(e) = self.reset_stale_in_flight().await {
            warn!("Failed to reset in-flight conditions: {}", e);
        }

        self.forward_changes(self.ctx.devices.changes(), cancel.clone());
        self.forward_changes(self.ctx.volume_groups.changes(), cancel.clone());

        let mut interval = tokio::time::interval(self.settings.scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.waker.woken() => {}
            }

            if let Err(e) = self.scan_once().await {
                error!("Scan failed: {}", e);
            }
        }
        info!("Scanner stopped");
    }

    fn forward_changes(&self, mut changes: BoxStream<'static, ()>, cancel: CancellationToken) {
        let waker = self.waker.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.next() => match change {
                        Some(()) => waker.wake(),
                        None => break,
                    },
                }
            }
        });
    }

    /// Clear in-flight conditions a previous process left behind; no effect
    /// of this process can own them yet
    pub async fn reset_stale_in_flight(&self) -> Result<usize> {
        let records = self.ctx.devices.list(&self.node_selector()).await?;
        let mut reset = 0;
        for device in records.iter().filter(|d| d.in_flight()) {
            info!("Resetting stale in-flight state of {} ({})", device.guid(), device.phase());
            update_with_retry(self.ctx.devices.as_ref(), device.guid(), |d| {
                for condition in ConditionType::IN_FLIGHT {
                    if d.condition_true(condition) {
                        d.set_condition(condition, false, "reset after restart");
                    }
                }
            })
            .await?;
            reset += 1;
        }
        Ok(reset)
    }

    // =========================================================================
    // Scan pass
    // =========================================================================

    /// One full discovery and reconciliation pass
    pub async fn scan_once(&self) -> Result<()> {
        let disks = self.source.scan().await?;
        let existing = self.ctx.devices.list(&self.node_selector()).await?;
        self.ctx.tags.initialize(&existing);

        let mut records: RecordMap = existing
            .into_iter()
            .map(|d| (d.guid().to_string(), d))
            .collect();
        let mut seen = HashSet::new();
        let owners = self.wwn_owners(&disks, &records);
        let mut wwns: HashMap<&str, &str> = HashMap::new();

        for disk in &disks {
            if self.filters.apply_exclude_disk(disk) {
                self.skipped("excluded");
                continue;
            }

            let guid = disk_guid(&self.ctx.node_name, disk);
            if present(&disk.wwn) {
                let holder = match (wwns.get(disk.wwn.as_str()), owners.get(disk.wwn.as_str())) {
                    (Some(first), _) => Some(*first),
                    (None, Some((owner, path))) if guid.as_deref() != Some(owner.as_str()) => {
                        Some(*path)
                    }
                    _ => None,
                };
                if let Some(existing) = holder {
                    let err = Error::DuplicateWwn {
                        wwn: disk.wwn.clone(),
                        device: disk.dev_path.clone(),
                        existing: existing.to_string(),
                    };
                    warn!("Skipping disk: {}", err);
                    self.skipped("duplicate_wwn");
                    continue;
                }
                wwns.insert(&disk.wwn, &disk.dev_path);
            }

            match guid {
                Some(guid) => {
                    self.observe(&mut records, &mut seen, guid, disk.device_status(), Some(disk))
                        .await;
                }
                None => self.no_identity(&disk.dev_path),
            }

            for part in &disk.partitions {
                if self.filters.apply_exclude_partition(disk, part) {
                    self.skipped("excluded");
                    continue;
                }
                match partition_guid(&self.ctx.node_name, part) {
                    Some(guid) => {
                        self.observe(&mut records, &mut seen, guid, disk.partition_status(part), None)
                            .await;
                    }
                    None => self.no_identity(&part.dev_path),
                }
            }
        }

        self.mark_missing(&mut records, &seen).await;

        let active = records
            .values()
            .filter(|d| d.state() == DeviceState::Active)
            .count();
        self.metrics.devices_active.set(active as i64);

        self.reconcile_records(&records).await;

        if let Err(e) = self.reconciler.reconcile_node().await {
            warn!("Volume group reconcile failed: {}", e);
        }

        self.metrics.scans.inc();
        debug!("Scan complete: {} disks, {} active records", disks.len(), active);
        Ok(())
    }

    /// WWNs held by disks that already have an active record, so a newly
    /// attached disk reporting the same WWN cannot take over the record
    fn wwn_owners<'a>(
        &self,
        disks: &'a [DiskInfo],
        records: &RecordMap,
    ) -> HashMap<&'a str, (String, &'a str)> {
        let mut owners = HashMap::new();
        for disk in disks.iter().filter(|d| present(&d.wwn)) {
            let Some(guid) = disk_guid(&self.ctx.node_name, disk) else {
                continue;
            };
            let active = records
                .get(&guid)
                .map(|r| r.state() == DeviceState::Active)
                .unwrap_or(false);
            if active {
                owners
                    .entry(disk.wwn.as_str())
                    .or_insert((guid, disk.dev_path.as_str()));
            }
        }
        owners
    }

    fn skipped(&self, reason: &str) {
        self.metrics.devices_skipped.with_label_values(&[reason]).inc();
    }

    fn no_identity(&self, dev_path: &str) {
        let err = Error::IdentityUndeterminable {
            device: dev_path.to_string(),
        };
        warn!("Skipping device: {}", err);
        self.skipped("no_identity");
    }

    /// Create or refresh the record for one discovered device
    async fn observe(
        &self,
        records: &mut RecordMap,
        seen: &mut HashSet<String>,
        guid: String,
        observed: DeviceStatus,
        disk: Option<&DiskInfo>,
    ) {
        seen.insert(guid.clone());

        let result = match records.get(&guid) {
            None => self.create_record(&guid, observed, disk).await,
            Some(existing) => self.refresh_record(existing, observed).await,
        };

        match result {
            Ok(Some(device)) => {
                records.insert(guid, device);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to record device {}: {}", guid, e),
        }
    }

    async fn create_record(
        &self,
        guid: &str,
        observed: DeviceStatus,
        disk: Option<&DiskInfo>,
    ) -> Result<Option<BlockDevice>> {
        let device_type = observed.details.device_type;
        let mut device = BlockDevice::new(
            guid,
            BlockDeviceSpec {
                dev_name: observed.dev_path.clone(),
                node_name: self.ctx.node_name.clone(),
                ..Default::default()
            },
        );
        let labels = device.labels_mut();
        labels.insert(LABEL_NODE.to_string(), self.ctx.node_name.clone());
        labels.insert(LABEL_DEVICE_TYPE.to_string(), device_type.to_string());

        if disk.map(|d| self.filters.apply_auto_provision(d)).unwrap_or(false) {
            info!("Auto-provisioning {} ({})", guid, observed.dev_path);
            let provisioner = self.settings.default_provisioner.clone();
            device.spec.file_system.force_formatted = true;
            if !provisioner.kind().consumes_raw_device() {
                device.spec.file_system.mount_point =
                    format!("{}/{}", self.settings.mount_root.trim_end_matches('/'), guid);
            }
            device.spec.provision = true;
            device.spec.provisioner = Some(provisioner);
        }

        device.status = Some(BlockDeviceStatus {
            state: DeviceState::Active,
            device_status: observed,
            ..Default::default()
        });

        info!(
            "Discovered {} {} as {}",
            device_type,
            device.spec.dev_name,
            guid
        );
        Ok(Some(self.ctx.devices.create(&device).await?))
    }

    async fn refresh_record(
        &self,
        existing: &BlockDevice,
        observed: DeviceStatus,
    ) -> Result<Option<BlockDevice>> {
        let current = existing.status();
        let merged = merge_observed(&current.device_status, observed);
        if current.state == DeviceState::Active && current.device_status == merged {
            return Ok(None);
        }

        if current.state != DeviceState::Active {
            info!("Device {} is back at {}", existing.guid(), merged.dev_path);
        }
        let updated = update_with_retry(self.ctx.devices.as_ref(), existing.guid(), |d| {
            let status = d.status_mut();
            status.state = DeviceState::Active;
            status.device_status = merge_observed(&status.device_status, merged.clone());
        })
        .await?;
        Ok(Some(updated))
    }

    async fn mark_missing(&self, records: &mut RecordMap, seen: &HashSet<String>) {
        let missing: Vec<String> = records
            .values()
            .filter(|d| d.state() == DeviceState::Active && !seen.contains(d.guid()))
            .map(|d| d.guid().to_string())
            .collect();

        for guid in missing {
            info!("Device {} is gone, marking inactive", guid);
            let result = update_with_retry(self.ctx.devices.as_ref(), &guid, |d| {
                d.status_mut().state = DeviceState::Inactive;
            })
            .await;
            match result {
                Ok(device) => {
                    records.insert(guid, device);
                }
                Err(e) => warn!("Failed to mark {} inactive: {}", guid, e),
            }
        }
    }

    /// Run the state machine over every record
    async fn reconcile_records(&self, records: &RecordMap) {
        for device in records.values() {
            let observed = match self.observe_backend(device, records).await {
                Ok(observed) => observed,
                Err(e) => {
                    warn!("Backend state of {} unavailable: {}", device.guid(), e);
                    continue;
                }
            };

            let transition = next(device, &observed);
            if transition.is_noop(device.phase()) {
                continue;
            }
            if let Err(e) = self.executor.dispatch(device, transition).await {
                warn!("Failed to dispatch for {}: {}", device.guid(), e);
            }
        }
    }

    /// Backend and topology facts the transition for `device` depends on
    async fn observe_backend(&self, device: &BlockDevice, records: &RecordMap) -> Result<Observed> {
        let mut observed = Observed::default();
        match device.phase() {
            ProvisionPhase::Mounted | ProvisionPhase::Provisioned => {
                let provisioner = BackendFactory::for_device(&self.ctx, device);
                observed.backend_path = provisioner.backend_path(device).await?;
            }
            ProvisionPhase::Partitioned => {
                // Only the partition the agent created; a stale pre-zap
                // partition still listed under the same parent has another PARTUUID
                let created = PartitionInfo {
                    part_uuid: device.status().device_status.child_part_uuid.clone(),
                    ..Default::default()
                };
                observed.child = partition_guid(&self.ctx.node_name, &created)
                    .and_then(|guid| records.get(&guid))
                    .filter(|r| r.state() == DeviceState::Active)
                    .map(|r| ChildPartition {
                        guid: r.guid().to_string(),
                        phase: r.phase(),
                    });
            }
            _ => {}
        }
        Ok(observed)
    }
}

/// Fresh kernel view, keeping the fields only the agent writes
fn merge_observed(previous: &DeviceStatus, mut observed: DeviceStatus) -> DeviceStatus {
    observed.partitioned = previous.partitioned;
    observed.child_part_uuid = previous.child_part_uuid.clone();
    observed.file_system.corrupted = previous.file_system.corrupted;
    observed.file_system.last_formatted_at = previous.file_system.last_formatted_at;
    observed
}
