//! Device Filter Module
//!
//! Exclusion and auto-provision filters and their per-node configuration.

pub mod config;
pub mod filters;

pub use config::{AutoProvisionRule, FilterConfig, FilterDocument, FilterRule};
pub use filters::{Filter, FilterSet};
