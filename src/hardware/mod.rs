//! Hardware Module
//!
//! Everything that touches the host: block device discovery and identity,
//! device filters, the hot-plug monitor and the disk tooling.

pub mod discovery;
pub mod filter;
pub mod monitor;
pub mod ops;

pub use discovery::*;
pub use filter::*;
pub use monitor::*;
pub use ops::SystemDiskOps;
