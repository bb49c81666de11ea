//! Custom Resource Definitions for the Node Disk Agent
//!
//! This module contains the record types the agent reads and writes:
//! - BlockDevice: one disk or partition and its provisioning state
//! - LvmVolumeGroup: membership of an LVM volume group on a node
//! - LonghornNode: the filesystem/raw-block backend's per-node disk map

pub mod block_device;
pub mod longhorn_node;
pub mod lvm_volume_group;

pub use block_device::*;
pub use longhorn_node::*;
pub use lvm_volume_group::*;
