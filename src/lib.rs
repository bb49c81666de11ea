//! Node Disk Agent - block device discovery and provisioning
//!
//! A per-node agent that discovers block devices, records them with stable
//! identities, and drives each record through partitioning, formatting,
//! mounting and hand-off to a storage backend (Longhorn filesystem or raw
//! block disks, LVM volume groups).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Node Disk Agent                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Hot-plug       │  │  Block Scanner  │  │  Filter Engine              │  │
//! │  │  Monitor        │  │  (sysfs + udev) │  │  (exclude / auto-provision) │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │ wake               │ devices                 │                  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  Scanner Loop         │──── records ───► RecordStore   │
//! │                    │  + State Machine      │                                │
//! │                    └───────────┬───────────┘                                │
//! │                                │ effects                                    │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  Effect Executor      │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌────────┴────────┐  ┌─────────────────────────────┐  │
//! │  │ Longhorn (fs)   │  │ Longhorn (raw)  │  │ LVM Volume Group            │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Scanner loop, state machine, executor and backends
//! - [`hardware`]: Kernel discovery, identities, filters and hot-plug events
//! - [`crd`]: Record types
//! - [`domain`]: Ports implemented by adapters
//! - [`store`]: Record store adapters
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod store;

// Re-export commonly used types
pub use controlplane::{
    parse_provisioner, Agent, AgentConfig, AgentDeps, AgentMetrics, BackendFactory,
    EffectExecutor, Scanner, ScannerSettings, VolumeGroupReconciler,
};

pub use crd::{
    BlockDevice, BlockDeviceSpec, BlockDeviceStatus, DeviceState, DeviceType, LonghornNode,
    LvmVolumeGroup, ProvisionPhase, ProvisionerKind, ProvisionerSpec,
};

pub use domain::ports::{DeviceSource, DiskOps, LvmOps, Provisioner, RecordStore, UeventSource};

pub use error::{Error, ErrorAction, Result};

pub use hardware::{
    disk_guid, partition_guid, BlockScanner, DiskInfo, FilterConfig, FilterSet, HotplugMonitor,
    KernelPaths, PartitionInfo, ScannerConfig, SystemDiskOps,
};

pub use store::{KubeStore, MemoryStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
