//! Hardware Discovery Module
//!
//! Discovers disks and partitions on Linux hosts from sysfs, the udev
//! database and the mount table, and derives their stable identities.

pub mod device;
pub mod identity;
pub mod mounts;
pub mod paths;
pub mod scanner;
pub mod udev;

pub use device::*;
pub use identity::{digest, disk_guid, partition_guid, present};
pub use mounts::{MountEntry, MountTable};
pub use paths::KernelPaths;
pub use scanner::*;
pub use udev::UdevRecord;
