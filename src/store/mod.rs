//! Record Store Adapters
//!
//! Implementations of [`crate::domain::ports::RecordStore`]:
//! - MemoryStore: in-process, versioned (standalone mode and tests)
//! - KubeStore: Kubernetes API via `kube`

pub mod kube_store;
pub mod memory;

pub use kube_store::*;
pub use memory::*;
