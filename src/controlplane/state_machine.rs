//! Provisioning State Machine
//!
//! [`next`] maps a device record and the backend state observed for it to
//! the next provision phase and the effect that gets it there. It performs
//! no I/O; the executor runs the effect and writes the result back.
//!
//! The filesystem backend walks `Partitioning -> Partitioned` (disks), then
//! `Formatting -> Formatted -> Mounting -> Mounted -> Provisioning ->
//! Provisioned`. Backends that consume the raw device skip partitioning and
//! mounting: `Formatting -> Formatted -> Provisioning -> Provisioned`.
//!
//! A phase with an in-flight condition set is never re-dispatched; only the
//! executor clears that condition. An in-flight phase whose condition is
//! clear (crash, requeue) dispatches its effect again.

use crate::crd::{BlockDevice, ConditionType, DeviceState, ProvisionPhase};
use std::fmt;
use std::time::Duration;

/// Wait for the kernel to expose a freshly created partition
pub const CHILD_PARTITION_DELAY: Duration = Duration::from_secs(5);

// =============================================================================
// Effects
// =============================================================================

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Look again after a delay; nothing to run yet
    Requeue(Duration),
    /// Replace the partition table with one full-size partition
    Partition,
    Format,
    Mount,
    Unmount,
    /// Attach to the backend
    Provision,
    /// Detach from the backend
    Unprovision,
    /// Sync tags to the backend
    Update,
    /// Hand the filesystem intent of a partitioned disk to its partition
    PropagateIntent { child: String },
}

impl Effect {
    pub fn name(&self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Requeue(_) => "requeue",
            Effect::Partition => "partition",
            Effect::Format => "format",
            Effect::Mount => "mount",
            Effect::Unmount => "unmount",
            Effect::Provision => "provision",
            Effect::Unprovision => "unprovision",
            Effect::Update => "update",
            Effect::PropagateIntent { .. } => "propagate-intent",
        }
    }

    /// Effect owned by an in-flight phase
    fn for_phase(phase: ProvisionPhase) -> Effect {
        match phase {
            ProvisionPhase::Partitioning => Effect::Partition,
            ProvisionPhase::Formatting => Effect::Format,
            ProvisionPhase::Mounting => Effect::Mount,
            ProvisionPhase::Unmounting => Effect::Unmount,
            ProvisionPhase::Provisioning => Effect::Provision,
            ProvisionPhase::Unprovisioning => Effect::Unprovision,
            _ => Effect::None,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of [`next`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub phase: ProvisionPhase,
    pub effect: Effect,
}

impl Transition {
    fn to(phase: ProvisionPhase, effect: Effect) -> Self {
        Self { phase, effect }
    }

    fn stay(phase: ProvisionPhase) -> Self {
        Self::to(phase, Effect::None)
    }

    /// Nothing to write and nothing to run
    pub fn is_noop(&self, current: ProvisionPhase) -> bool {
        self.phase == current && self.effect == Effect::None
    }
}

// =============================================================================
// Observations
// =============================================================================

/// State of the partition created on a partitioned disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildPartition {
    pub guid: String,
    pub phase: ProvisionPhase,
}

/// Backend and topology facts [`next`] needs besides the record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observed {
    /// Path the backend records for this device; `None` when it has no entry
    pub backend_path: Option<String>,
    /// Partition of this disk, once the kernel exposes it
    pub child: Option<ChildPartition>,
}

// =============================================================================
// Transition Function
// =============================================================================

/// Next phase and effect for `device`
pub fn next(device: &BlockDevice, observed: &Observed) -> Transition {
    let phase = device.phase();

    if let Some(condition) = phase.in_flight_condition() {
        if device.condition_true(condition) {
            return Transition::stay(phase);
        }
        return Transition::to(phase, Effect::for_phase(phase));
    }

    // A missing device can only be detached
    if device.state() == DeviceState::Inactive && phase != ProvisionPhase::Provisioned {
        return Transition::stay(phase);
    }

    match phase {
        ProvisionPhase::Unprovisioned => unprovisioned(device),
        ProvisionPhase::Partitioned => partitioned(device, observed),
        ProvisionPhase::Formatted => formatted(device),
        ProvisionPhase::Mounted => mounted(device, observed),
        ProvisionPhase::Provisioned => provisioned(device, observed),
        // Failed is terminal until the phase is reset externally
        _ => Transition::stay(phase),
    }
}

fn unprovisioned(device: &BlockDevice) -> Transition {
    let raw = device.provisioner_kind().consumes_raw_device();
    let wanted = device.spec.file_system.force_formatted || (raw && device.spec.provision);
    if !wanted {
        return Transition::stay(ProvisionPhase::Unprovisioned);
    }

    if device.is_disk() && !raw {
        if device.condition_true(ConditionType::Partitioned) {
            return Transition::stay(ProvisionPhase::Partitioned);
        }
        return Transition::to(ProvisionPhase::Partitioning, Effect::Partition);
    }

    if device.condition_true(ConditionType::Formatted) {
        return Transition::stay(ProvisionPhase::Formatted);
    }
    Transition::to(ProvisionPhase::Formatting, Effect::Format)
}

fn partitioned(device: &BlockDevice, observed: &Observed) -> Transition {
    match &observed.child {
        None => Transition::to(
            ProvisionPhase::Partitioned,
            Effect::Requeue(CHILD_PARTITION_DELAY),
        ),
        Some(child) if child.phase == ProvisionPhase::Unprovisioned && device.has_intent() => {
            Transition::to(
                ProvisionPhase::Partitioned,
                Effect::PropagateIntent {
                    child: child.guid.clone(),
                },
            )
        }
        Some(_) => Transition::stay(ProvisionPhase::Partitioned),
    }
}

fn formatted(device: &BlockDevice) -> Transition {
    if device.provisioner_kind().consumes_raw_device() {
        if device.spec.provision {
            return Transition::to(ProvisionPhase::Provisioning, Effect::Provision);
        }
        return Transition::stay(ProvisionPhase::Formatted);
    }

    let desired = device.desired_mount_point();
    let current = device.observed_mount_point();
    if desired == current {
        if desired.is_empty() {
            return Transition::stay(ProvisionPhase::Formatted);
        }
        return Transition::stay(ProvisionPhase::Mounted);
    }
    if !current.is_empty() {
        return Transition::to(ProvisionPhase::Unmounting, Effect::Unmount);
    }
    Transition::to(ProvisionPhase::Mounting, Effect::Mount)
}

fn mounted(device: &BlockDevice, observed: &Observed) -> Transition {
    let desired = device.desired_mount_point();
    if desired != device.observed_mount_point() {
        return Transition::to(ProvisionPhase::Unmounting, Effect::Unmount);
    }

    if let Some(path) = &observed.backend_path {
        if path != desired {
            return Transition::to(ProvisionPhase::Unprovisioning, Effect::Unprovision);
        }
    }

    if device.spec.provision {
        return Transition::to(ProvisionPhase::Provisioning, Effect::Provision);
    }
    Transition::stay(ProvisionPhase::Mounted)
}

fn provisioned(device: &BlockDevice, observed: &Observed) -> Transition {
    let raw = device.provisioner_kind().consumes_raw_device();
    let desired = device.desired_mount_point();

    let stale = match &observed.backend_path {
        None => true,
        Some(path) => !raw && (desired.is_empty() || path != desired),
    };
    if !device.spec.provision || stale {
        return Transition::to(ProvisionPhase::Unprovisioning, Effect::Unprovision);
    }

    if !same_tags(&device.spec.tags, &device.status().tags) {
        return Transition::to(ProvisionPhase::Provisioned, Effect::Update);
    }
    Transition::stay(ProvisionPhase::Provisioned)
}

fn same_tags(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}
