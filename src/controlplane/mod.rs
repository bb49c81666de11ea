//! Provisioning Control Plane
//!
//! The per-node reconciliation machinery: the scanner loop reconciles
//! kernel-observed devices into records, the state machine picks the next
//! step for each record, and the executor runs that step against a backend.

pub mod agent;
pub mod backends;
pub mod context;
pub mod executor;
pub mod metrics;
pub mod retry;
pub mod scanner;
pub mod state_machine;
pub mod waker;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{parse_provisioner, Agent, AgentConfig, AgentDeps};
pub use backends::{BackendFactory, VolumeGroupReconciler};
pub use context::{DiskTags, ProvisionerContext, DEFAULT_FORMAT_CONCURRENCY};
pub use executor::EffectExecutor;
pub use metrics::AgentMetrics;
pub use retry::update_with_retry;
pub use scanner::{Scanner, ScannerSettings, DEFAULT_SCAN_INTERVAL};
pub use state_machine::{next, ChildPartition, Effect, Observed, Transition};
pub use waker::Waker;
