//! Hot-plug Monitor Module
//!
//! Kernel uevent parsing, the netlink event source and the monitor task
//! that turns block add/remove events into scanner wake-ups.

pub mod hotplug;
pub mod uevent;

pub use hotplug::{HotplugMonitor, UeventSourceFactory, DEFAULT_RESPAWN_DELAY};
pub use uevent::{parse_uevent, NetlinkSource, Uevent, UeventAction};
