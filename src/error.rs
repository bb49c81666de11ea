//! Error types for the Node Disk Agent
//!
//! Provides structured error types for device discovery, filtering, the
//! provisioning state machine, backend provisioners and the record store.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Record Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Version conflict updating {kind}/{name}")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Discovery Errors
    // =========================================================================
    #[error("Hardware discovery failed: {0}")]
    HardwareDiscovery(String),

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Cannot derive a stable identity for {device}")]
    IdentityUndeterminable { device: String },

    #[error("Duplicate WWN {wwn} on {device}, already claimed by {existing}")]
    DuplicateWwn {
        wwn: String,
        device: String,
        existing: String,
    },

    #[error("No persistent path for device {device}")]
    NoPersistentPath { device: String },

    // =========================================================================
    // Command / Backend Errors
    // =========================================================================
    #[error("Command failed: {command} - {reason}")]
    Command { command: String, reason: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Unknown provisioner: {0}")]
    UnknownProvisioner(String),

    // =========================================================================
    // Monitor Errors
    // =========================================================================
    #[error("Uevent socket error: {0}")]
    MonitorSocket(String),

    #[error("Injected monitor fault")]
    InjectedFault,

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::ResourceExists {
                    kind: "record".into(),
                    name: resp.message.clone(),
                }
            }
            kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict {
                kind: "record".into(),
                name: resp.message.clone(),
            },
            other => Error::Kube(other),
        }
    }
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Conflict { .. } | Error::MonitorSocket(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Devices the kernel has not settled yet
            Error::DeviceNotFound { .. } | Error::NoPersistentPath { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(10))
            }

            // Operational failures wait for an operator
            Error::Command { .. }
            | Error::BackendOperationFailed { .. }
            | Error::IdentityUndeterminable { .. }
            | Error::DuplicateWwn { .. }
            | Error::UnknownProvisioner(_)
            | Error::Configuration(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is a missing record
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Conflict { .. } | Error::MonitorSocket(_)
        )
    }

    /// Shorthand for a failed external command
    pub fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Command {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the agent
pub type Result<T> = std::result::Result<T, Error>;
