//! Effects Executor
//!
//! Turns [`Transition`]s into record writes and host or backend work.
//! In-flight effects are claimed by writing their phase and condition,
//! then run as detached tasks on a [`TaskTracker`]; the task re-reads the
//! record when it finishes and writes the outcome through
//! [`update_with_retry`]. Tag updates and intent propagation are quick
//! record writes and run inline.
//!
//! Failure policy:
//! - transient errors (API, conflicts, not-yet-settled devices) clear the
//!   in-flight condition so the effect is dispatched again after a delay
//! - everything else sets the `Failed` phase with the error text in the
//!   condition message

use crate::controlplane::backends::BackendFactory;
use crate::controlplane::context::ProvisionerContext;
use crate::controlplane::metrics::AgentMetrics;
use crate::controlplane::retry::update_with_retry;
use crate::controlplane::state_machine::{Effect, Transition};
use crate::controlplane::waker::Waker;
use crate::crd::{BlockDevice, BlockDeviceStatus, ConditionType, ProvisionPhase};
use crate::error::{Error, ErrorAction, Result};
use crate::hardware::discovery::MountTable;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type StatusMutation = Box<dyn Fn(&mut BlockDeviceStatus) + Send + Sync>;

/// How an effect ended
enum Outcome {
    /// Move to `phase` and apply `mutate` to the status
    Done { phase: ProvisionPhase, mutate: StatusMutation },
    /// Backend not ready; run the effect again after the requeue delay
    Requeue,
    /// Terminal failure with extra status changes
    Fail { reason: String, mutate: StatusMutation },
}

impl Outcome {
    fn done(phase: ProvisionPhase, mutate: impl Fn(&mut BlockDeviceStatus) + Send + Sync + 'static) -> Self {
        Outcome::Done {
            phase,
            mutate: Box::new(mutate),
        }
    }
}

/// Runs effects for the scanner
#[derive(Clone)]
pub struct EffectExecutor {
    ctx: Arc<ProvisionerContext>,
    waker: Waker,
    metrics: Arc<AgentMetrics>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    /// Pending delayed rescans per device
    requeued: Arc<Mutex<HashMap<String, Instant>>>,
}

impl EffectExecutor {
    pub fn new(
        ctx: Arc<ProvisionerContext>,
        waker: Waker,
        metrics: Arc<AgentMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            waker,
            metrics,
            tracker: TaskTracker::new(),
            cancel,
            requeued: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Tracker owning every detached effect task
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Apply a transition computed for `device`
    pub async fn dispatch(&self, device: &BlockDevice, transition: Transition) -> Result<()> {
        let guid = device.guid().to_string();

        match transition.effect {
            Effect::None => self.write_phase(device, transition.phase).await,
            Effect::Requeue(delay) => {
                self.write_phase(device, transition.phase).await?;
                self.requeue(&guid, delay);
                Ok(())
            }
            Effect::Update => {
                self.write_phase(device, transition.phase).await?;
                self.update_tags(device).await
            }
            Effect::PropagateIntent { child } => self.propagate_intent(device, &child).await,
            effect => {
                let Some(condition) = transition.phase.in_flight_condition() else {
                    return Err(Error::Internal(format!(
                        "{} effect requested without an in-flight phase ({})",
                        effect, transition.phase
                    )));
                };

                let mut already_running = false;
                let claimed = update_with_retry(self.ctx.devices.as_ref(), &guid, |d| {
                    already_running = d.condition_true(condition);
                    if !already_running {
                        d.status_mut().provision_phase = transition.phase;
                        d.set_condition(condition, true, "");
                    }
                })
                .await?;
                if already_running {
                    debug!("{} already running {} effect", guid, effect);
                    return Ok(());
                }

                info!("{}: {} -> {} ({})", guid, device.phase(), transition.phase, effect);
                self.metrics
                    .effects_dispatched
                    .with_label_values(&[effect.name()])
                    .inc();

                let executor = self.clone();
                self.tracker.spawn(async move {
                    executor.run(claimed, effect, condition).await;
                });
                Ok(())
            }
        }
    }

    async fn write_phase(&self, device: &BlockDevice, phase: ProvisionPhase) -> Result<()> {
        if device.phase() == phase {
            return Ok(());
        }
        debug!("{}: {} -> {}", device.guid(), device.phase(), phase);
        update_with_retry(self.ctx.devices.as_ref(), device.guid(), |d| {
            d.status_mut().provision_phase = phase;
        })
        .await?;
        Ok(())
    }

    /// Schedule one delayed rescan per device
    fn requeue(&self, guid: &str, delay: Duration) {
        let now = Instant::now();
        let mut requeued = self.requeued.lock();
        requeued.retain(|_, due| *due > now);
        if requeued.contains_key(guid) {
            return;
        }
        requeued.insert(guid.to_string(), now + delay);
        self.waker.wake_after(delay, self.cancel.clone());
    }

    // =========================================================================
    // Detached effects
    // =========================================================================

    async fn run(&self, device: BlockDevice, effect: Effect, condition: ConditionType) {
        let outcome = match effect {
            Effect::Partition => self.partition(&device).await,
            Effect::Format => self.format(&device).await,
            Effect::Mount => self.mount(&device).await,
            Effect::Unmount => self.unmount(&device).await,
            Effect::Provision => self.provision(&device).await,
            Effect::Unprovision => self.unprovision(&device).await,
            _ => Ok(Outcome::Requeue),
        };

        if let Err(e) = self.complete(&device, &effect, condition, outcome).await {
            error!("Failed to record {} result for {}: {}", effect, device.guid(), e);
        }
    }

    async fn complete(
        &self,
        device: &BlockDevice,
        effect: &Effect,
        condition: ConditionType,
        outcome: Result<Outcome>,
    ) -> Result<()> {
        let guid = device.guid();
        let devices = self.ctx.devices.as_ref();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => match retry_delay(&e, self.ctx.requeue_delay) {
                Some(delay) => {
                    warn!("{} {} will be retried in {:?}: {}", guid, effect, delay, e);
                    return self.release_after(guid, condition, delay, e.to_string()).await;
                }
                None => Outcome::Fail {
                    reason: e.to_string(),
                    mutate: Box::new(|_| {}),
                },
            },
        };

        match outcome {
            Outcome::Done { phase, mutate } => {
                info!("{}: {} completed, now {}", guid, effect, phase);
                update_with_retry(devices, guid, |d| {
                    let status = d.status_mut();
                    status.provision_phase = phase;
                    mutate(status);
                    status.set_condition(condition, false, "");
                })
                .await?;
                self.waker.wake();
                Ok(())
            }
            Outcome::Requeue => {
                debug!("{}: {} not ready, requeueing", guid, effect);
                self.release_after(guid, condition, self.ctx.requeue_delay, "waiting for backend")
                    .await
            }
            Outcome::Fail { reason, mutate } => {
                error!("{}: {} failed: {}", guid, effect, reason);
                self.metrics
                    .effects_failed
                    .with_label_values(&[effect.name()])
                    .inc();
                update_with_retry(devices, guid, |d| {
                    let status = d.status_mut();
                    status.provision_phase = ProvisionPhase::Failed;
                    mutate(status);
                    status.set_condition(condition, false, reason.clone());
                })
                .await?;
                Ok(())
            }
        }
    }

    /// Keep the device claimed for `delay`, then clear the in-flight
    /// condition so the next scan dispatches the effect again
    async fn release_after(
        &self,
        guid: &str,
        condition: ConditionType,
        delay: Duration,
        message: impl Into<String>,
    ) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        let message = message.into();
        update_with_retry(self.ctx.devices.as_ref(), guid, |d| {
            d.set_condition(condition, false, message.clone());
        })
        .await?;
        self.waker.wake();
        Ok(())
    }

    async fn partition(&self, device: &BlockDevice) -> Result<Outcome> {
        let mount_point = device.observed_mount_point();
        if !mount_point.is_empty() {
            return Ok(Outcome::Fail {
                reason: format!("{} is mounted at {}", device.dev_path(), mount_point),
                mutate: Box::new(|_| {}),
            });
        }

        let part_uuid = Uuid::new_v4().to_string();
        self.ctx
            .disk_ops
            .create_single_partition(device.dev_path(), &part_uuid)
            .await?;
        Ok(Outcome::done(ProvisionPhase::Partitioned, move |status| {
            status.device_status.partitioned = true;
            status.device_status.child_part_uuid = part_uuid.clone();
            status.set_condition(ConditionType::Partitioned, true, "");
        }))
    }

    async fn format(&self, device: &BlockDevice) -> Result<Outcome> {
        let provisioner = BackendFactory::for_device(&self.ctx, device);
        let outcome = provisioner.format(device, device.dev_path()).await?;
        if outcome.requeue {
            return Ok(Outcome::Requeue);
        }

        let formatted = outcome.formatted;
        Ok(Outcome::done(ProvisionPhase::Formatted, move |status| {
            if formatted {
                let fs = &mut status.device_status.file_system;
                fs.last_formatted_at = Some(Utc::now());
                fs.corrupted = false;
            }
            status.set_condition(ConditionType::Formatted, true, "");
        }))
    }

    async fn mount(&self, device: &BlockDevice) -> Result<Outcome> {
        let mount_point = device.desired_mount_point().to_string();
        let source = self
            .ctx
            .scanner
            .resolve_persistent_path(&device.status().device_status)
            .await?;

        match self.ctx.disk_ops.mount(&source, &mount_point).await {
            Ok(()) => Ok(Outcome::done(ProvisionPhase::Mounted, move |status| {
                status.device_status.file_system.mount_point = mount_point.clone();
                status.set_condition(ConditionType::Mounted, true, "");
            })),
            Err(e) if is_corruption(&e) => Ok(Outcome::Fail {
                reason: e.to_string(),
                mutate: Box::new(|status| {
                    status.device_status.file_system.corrupted = true;
                }),
            }),
            Err(e) => Err(e),
        }
    }

    async fn unmount(&self, device: &BlockDevice) -> Result<Outcome> {
        let provisioner = BackendFactory::for_device(&self.ctx, device);
        if provisioner.unformat(device).await? {
            return Ok(Outcome::Requeue);
        }
        Ok(Outcome::done(ProvisionPhase::Formatted, |status| {
            status.device_status.file_system.mount_point.clear();
            status.set_condition(ConditionType::Mounted, false, "");
        }))
    }

    async fn provision(&self, device: &BlockDevice) -> Result<Outcome> {
        let provisioner = BackendFactory::for_device(&self.ctx, device);
        if provisioner.provision(device).await? {
            return Ok(Outcome::Requeue);
        }

        let tags = device.spec.tags.clone();
        Ok(Outcome::done(ProvisionPhase::Provisioned, move |status| {
            status.tags = tags.clone();
            status.set_condition(ConditionType::Provisioned, true, "");
            status.set_condition(ConditionType::AddedToNode, true, "");
        }))
    }

    async fn unprovision(&self, device: &BlockDevice) -> Result<Outcome> {
        let provisioner = BackendFactory::for_device(&self.ctx, device);
        if provisioner.unprovision(device).await? {
            return Ok(Outcome::Requeue);
        }

        // The mount rules re-derive Formatted/Mounted from Unprovisioned
        let mounted = self.still_mounted(device);
        Ok(Outcome::done(ProvisionPhase::Unprovisioned, move |status| {
            if !mounted {
                status.device_status.file_system.mount_point.clear();
                status.set_condition(ConditionType::Mounted, false, "");
            }
            status.tags.clear();
            status.set_condition(ConditionType::Provisioned, false, "");
            status.set_condition(ConditionType::AddedToNode, false, "");
        }))
    }

    /// Whether the observed mount point is still in the live mount table
    fn still_mounted(&self, device: &BlockDevice) -> bool {
        let mount_point = device.observed_mount_point();
        if mount_point.is_empty() {
            return false;
        }
        match MountTable::load(&self.ctx.scanner.paths().mounts) {
            Ok(table) => table.is_mount_point(mount_point),
            Err(e) => {
                warn!("Mount table unreadable, trusting recorded mount: {}", e);
                true
            }
        }
    }

    // =========================================================================
    // Inline effects
    // =========================================================================

    async fn update_tags(&self, device: &BlockDevice) -> Result<()> {
        let guid = device.guid();
        let provisioner = BackendFactory::for_device(&self.ctx, device);
        match provisioner.update(device).await {
            Ok(true) => {
                self.requeue(guid, self.ctx.requeue_delay);
                Ok(())
            }
            Ok(false) => {
                let tags = device.spec.tags.clone();
                update_with_retry(self.ctx.devices.as_ref(), guid, |d| {
                    d.status_mut().tags = tags.clone();
                })
                .await?;
                debug!("{}: backend tags synced", guid);
                Ok(())
            }
            Err(e) => {
                warn!("{}: tag sync failed: {}", guid, e);
                self.metrics
                    .effects_failed
                    .with_label_values(&[Effect::Update.name()])
                    .inc();
                self.requeue(guid, self.ctx.requeue_delay);
                Ok(())
            }
        }
    }

    /// Move the filesystem and backend intent of a partitioned disk onto its
    /// partition; the disk keeps none of it
    async fn propagate_intent(&self, disk: &BlockDevice, child: &str) -> Result<()> {
        let spec = disk.spec.clone();
        update_with_retry(self.ctx.devices.as_ref(), child, |d| {
            d.spec.file_system = spec.file_system.clone();
            d.spec.provision = spec.provision;
            d.spec.provisioner = spec.provisioner.clone();
            d.spec.tags = spec.tags.clone();
        })
        .await?;

        update_with_retry(self.ctx.devices.as_ref(), disk.guid(), |d| {
            d.spec.file_system.force_formatted = false;
            d.spec.file_system.mount_point.clear();
            d.spec.provision = false;
        })
        .await?;

        info!("{}: intent handed to partition {}", disk.guid(), child);
        Ok(())
    }
}

/// Delay before retrying an effect that failed with `err`, or `None` when
/// the failure is terminal
fn retry_delay(err: &Error, default: Duration) -> Option<Duration> {
    match err.action() {
        ErrorAction::RequeueAfter(delay) => Some(delay),
        ErrorAction::RequeueWithBackoff if err.is_transient() => Some(default),
        _ => None,
    }
}

/// Mount errors that mean the filesystem itself is damaged
fn is_corruption(err: &Error) -> bool {
    match err {
        Error::Command { reason, .. } => {
            reason.contains("bad superblock") || reason.contains("wrong fs type")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::state_machine::{next, Observed};
    use crate::controlplane::testing::{TestEnv, NODE};
    use crate::crd::{DeviceType, ProvisionerSpec};
    use crate::domain::ports::RecordStore;

    struct Harness {
        env: TestEnv,
        executor: EffectExecutor,
        waker: Waker,
    }

    impl Harness {
        fn new() -> Self {
            let env = TestEnv::new();
            let waker = Waker::new();
            let executor = EffectExecutor::new(
                env.ctx.clone(),
                waker.clone(),
                Arc::new(AgentMetrics::new().unwrap()),
                CancellationToken::new(),
            );
            Self {
                env,
                executor,
                waker,
            }
        }

        async fn get(&self, guid: &str) -> BlockDevice {
            self.env.devices.get(guid).await.unwrap().unwrap()
        }

        /// Dispatch the next transition and wait for any detached effect
        async fn step(&self, guid: &str, observed: &Observed) -> BlockDevice {
            let device = self.get(guid).await;
            let transition = next(&device, observed);
            self.executor.dispatch(&device, transition).await.unwrap();
            self.settle().await;
            self.get(guid).await
        }

        async fn settle(&self) {
            let tracker = self.executor.tracker().clone();
            tracker.close();
            tracker.wait().await;
            tracker.reopen();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_drops_due_entries() {
        let h = Harness::new();
        h.executor.requeue("guid-sdb", Duration::from_secs(1));
        h.executor.requeue("guid-sdb", Duration::from_secs(1));
        assert_eq!(h.executor.requeued.lock().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        h.executor.requeue("guid-sdc", Duration::from_secs(1));

        let requeued = h.executor.requeued.lock();
        assert_eq!(requeued.len(), 1);
        assert!(requeued.contains_key("guid-sdc"));
    }

    #[tokio::test]
    async fn test_partition_effect() {
        let h = Harness::new();
        let mut disk = h.env.device("sdb", DeviceType::Disk);
        disk.spec.file_system.force_formatted = true;
        h.env.save(&disk).await;

        let disk = h.step("guid-sdb", &Observed::default()).await;
        assert_eq!(disk.phase(), ProvisionPhase::Partitioned);
        assert!(disk.status().device_status.partitioned);
        assert!(Uuid::parse_str(&disk.status().device_status.child_part_uuid).is_ok());
        assert!(disk.condition_true(ConditionType::Partitioned));
        assert!(!disk.in_flight());
        assert_eq!(h.env.ops.calls(), vec!["partition /dev/sdb"]);
        assert_eq!(
            h.executor
                .metrics
                .effects_dispatched
                .with_label_values(&["partition"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_format_failure_sets_failed() {
        let h = Harness::new();
        let mut part = h.env.device("sdb1", DeviceType::Part);
        part.spec.file_system.force_formatted = true;
        h.env.save(&part).await;
        h.env.ops.fail("mkfs", "mkfs.ext4: Device size reported to be zero");

        let part = h.step("guid-sdb1", &Observed::default()).await;
        assert_eq!(part.phase(), ProvisionPhase::Failed);
        let condition = part.condition(ConditionType::Formatting).unwrap();
        assert!(!condition.status);
        assert!(condition.message.contains("Device size reported to be zero"));

        // Failed stays put
        let again = next(&part, &Observed::default());
        assert!(again.is_noop(ProvisionPhase::Failed));
    }

    #[tokio::test]
    async fn test_partition_walks_to_provisioned() {
        let h = Harness::new();
        h.env.longhorn_node().await;
        h.env.fixture.link("/dev/disk/by-uuid/1111");

        let mut part = h.env.device("sdb1", DeviceType::Part);
        part.spec.file_system.force_formatted = true;
        part.spec.file_system.mount_point = "/var/lib/disks/guid-sdb1".into();
        part.spec.provision = true;
        part.spec.tags = vec!["ssd".into()];
        part.status_mut().device_status.details.fs_uuid = "1111".into();
        h.env.save(&part).await;

        let none = Observed::default();
        let part = h.step("guid-sdb1", &none).await;
        assert_eq!(part.phase(), ProvisionPhase::Formatted);
        assert!(part.status().device_status.file_system.last_formatted_at.is_some());

        let part = h.step("guid-sdb1", &none).await;
        assert_eq!(part.phase(), ProvisionPhase::Mounted);
        assert_eq!(part.observed_mount_point(), "/var/lib/disks/guid-sdb1");

        let part = h.step("guid-sdb1", &none).await;
        assert_eq!(part.phase(), ProvisionPhase::Provisioned);
        assert_eq!(part.status().tags, vec!["ssd"]);

        let node = h.env.nodes.get(NODE).await.unwrap().unwrap();
        assert_eq!(node.disk("guid-sdb1").unwrap().path, "/var/lib/disks/guid-sdb1");
        assert_eq!(
            h.env.ops.calls(),
            vec![
                "mkfs /dev/sdb1 1111",
                "mount /dev/disk/by-uuid/1111 /var/lib/disks/guid-sdb1",
            ]
        );
    }

    #[tokio::test]
    async fn test_mount_corruption_marks_device() {
        let h = Harness::new();
        h.env.fixture.link("/dev/disk/by-uuid/1111");
        let mut part = h.env.device("sdb1", DeviceType::Part);
        part.spec.file_system.mount_point = "/mnt/x".into();
        part.status_mut().provision_phase = ProvisionPhase::Formatted;
        part.status_mut().device_status.details.fs_uuid = "1111".into();
        h.env.save(&part).await;
        h.env
            .ops
            .fail("mount", "mount: /mnt/x: wrong fs type, bad option, bad superblock");

        let part = h.step("guid-sdb1", &Observed::default()).await;
        assert_eq!(part.phase(), ProvisionPhase::Failed);
        assert!(part.status().device_status.file_system.corrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_without_persistent_path_requeues() {
        let h = Harness::new();
        let mut part = h.env.device("sdb1", DeviceType::Part);
        part.spec.file_system.mount_point = "/mnt/x".into();
        part.status_mut().provision_phase = ProvisionPhase::Formatted;
        h.env.save(&part).await;

        let part = h.step("guid-sdb1", &Observed::default()).await;
        assert_eq!(part.phase(), ProvisionPhase::Mounting);
        assert!(!part.condition_true(ConditionType::Mounting));
        assert!(h.env.ops.calls().is_empty());
        assert!(tokio::time::timeout(Duration::from_secs(1), h.waker.woken())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_claimed_effect_is_not_dispatched_twice() {
        let h = Harness::new();
        let mut part = h.env.device("sdb1", DeviceType::Part);
        part.spec.file_system.force_formatted = true;
        let saved = h.env.save(&part).await;

        // Another writer claimed it between read and dispatch
        let mut claimed = saved.clone();
        claimed.status_mut().provision_phase = ProvisionPhase::Formatting;
        claimed.set_condition(ConditionType::Formatting, true, "");
        h.env.devices.update(&claimed).await.unwrap();

        let transition = next(&saved, &Observed::default());
        h.executor.dispatch(&saved, transition).await.unwrap();
        h.settle().await;
        assert!(h.env.ops.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unprovision_absent_device_completes() {
        let h = Harness::new();
        h.env.longhorn_node().await;
        let mut part = h.env.device("sdb1", DeviceType::Part);
        part.spec.file_system.mount_point = "/mnt/x".into();
        part.status_mut().provision_phase = ProvisionPhase::Provisioned;
        part.status_mut().device_status.file_system.mount_point = "/mnt/x".into();
        part.set_condition(ConditionType::Provisioned, true, "");
        h.env.save(&part).await;
        h.env.fixture.mounts("/dev/sdb1 /mnt/x ext4 rw 0 0\n");

        // Backend has no entry for it
        let part = h.step("guid-sdb1", &Observed::default()).await;
        assert_eq!(part.phase(), ProvisionPhase::Unprovisioned);
        assert!(!part.condition_true(ConditionType::Provisioned));
        assert!(!part.condition_true(ConditionType::AddedToNode));
        assert!(!part.in_flight());
        // Still mounted on the host, so the mount is kept for the mount rules
        assert_eq!(part.observed_mount_point(), "/mnt/x");
    }

    #[tokio::test]
    async fn test_unprovision_clears_released_mount() {
        let h = Harness::new();
        h.env.longhorn_node().await;
        let mut part = h.env.device("sdb1", DeviceType::Part);
        part.status_mut().provision_phase = ProvisionPhase::Provisioned;
        part.status_mut().device_status.file_system.mount_point = "/mnt/x".into();
        part.set_condition(ConditionType::Mounted, true, "");
        part.set_condition(ConditionType::Provisioned, true, "");
        h.env.save(&part).await;

        let part = h.step("guid-sdb1", &Observed::default()).await;
        assert_eq!(part.phase(), ProvisionPhase::Unprovisioned);
        assert_eq!(part.observed_mount_point(), "");
        assert!(!part.condition_true(ConditionType::Mounted));
    }

    #[tokio::test]
    async fn test_propagate_intent_moves_to_one_child() {
        let h = Harness::new();
        let mut disk = h.env.device("sdb", DeviceType::Disk);
        disk.spec.file_system.force_formatted = true;
        disk.spec.file_system.mount_point = "/mnt/x".into();
        disk.spec.provision = true;
        disk.spec.provisioner = Some(ProvisionerSpec::Filesystem);
        disk.status_mut().provision_phase = ProvisionPhase::Partitioned;
        h.env.save(&disk).await;
        h.env.save(&h.env.device("sdb1", DeviceType::Part)).await;

        let observed = Observed {
            backend_path: None,
            child: Some(crate::controlplane::state_machine::ChildPartition {
                guid: "guid-sdb1".into(),
                phase: ProvisionPhase::Unprovisioned,
            }),
        };
        let disk = h.step("guid-sdb", &observed).await;
        assert!(!disk.has_intent());

        let child = h.get("guid-sdb1").await;
        assert!(child.spec.file_system.force_formatted);
        assert_eq!(child.desired_mount_point(), "/mnt/x");
        assert!(child.spec.provision);

        // The disk has nothing left to hand over
        assert!(next(&disk, &observed).is_noop(ProvisionPhase::Partitioned));
    }

    #[tokio::test]
    async fn test_update_effect_syncs_tags() {
        let h = Harness::new();
        h.env.longhorn_node().await;
        let mut part = h.env.device("sdb1", DeviceType::Part);
        part.spec.file_system.mount_point = "/mnt/x".into();
        part.spec.provision = true;
        part.status_mut().provision_phase = ProvisionPhase::Mounted;
        part.status_mut().device_status.file_system.mount_point = "/mnt/x".into();
        h.env.save(&part).await;

        let part = h.step("guid-sdb1", &Observed::default()).await;
        assert_eq!(part.phase(), ProvisionPhase::Provisioned);

        let mut updated = part.clone();
        updated.spec.tags = vec!["fast".into()];
        h.env.devices.update(&updated).await.unwrap();

        let observed = Observed {
            backend_path: Some("/mnt/x".into()),
            child: None,
        };
        let part = h.step("guid-sdb1", &observed).await;
        assert_eq!(part.phase(), ProvisionPhase::Provisioned);
        assert_eq!(part.status().tags, vec!["fast"]);
        let node = h.env.nodes.get(NODE).await.unwrap().unwrap();
        assert_eq!(node.disk("guid-sdb1").unwrap().tags, vec!["fast"]);
    }

    #[test]
    fn test_retry_policy() {
        let default = Duration::from_secs(3);
        assert_eq!(
            retry_delay(
                &Error::Conflict {
                    kind: "BlockDevice".into(),
                    name: "x".into()
                },
                default
            ),
            Some(default)
        );
        assert_eq!(
            retry_delay(
                &Error::NoPersistentPath {
                    device: "/dev/sdb1".into()
                },
                default
            ),
            Some(Duration::from_secs(10))
        );
        assert_eq!(retry_delay(&Error::command("mkfs.ext4", "boom"), default), None);
        assert!(is_corruption(&Error::command("mount", "wrong fs type")));
        assert!(!is_corruption(&Error::command("mount", "busy")));
    }
}
