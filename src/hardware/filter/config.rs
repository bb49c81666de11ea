//! Filter Configuration
//!
//! Loads exclude and auto-provision rules from a YAML document:
//!
//! ```yaml
//! filters:
//!   - hostname: "*"
//!     excludeLabels: ["COS_*"]
//!     excludeVendors: ["longhorn"]
//!   - hostname: "worker-*"
//!     excludeDevices: ["/dev/sdz"]
//! autoprovision:
//!   - hostname: "worker-1"
//!     devices: ["/dev/sd[b-d]"]
//! ```
//!
//! `"*"` rules apply on every node, glob and exact hostname rules add to
//! them. Matching rules extend the static defaults and never replace them.
//! A missing document, unreadable file, parse error or missing key falls
//! back to the defaults alone; loading never fails.

use super::filters::{Filter, FilterSet};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Hostname pattern that applies everywhere
pub const GLOBAL_HOST: &str = "*";

// =============================================================================
// Document
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterDocument {
    pub filters: Option<Vec<FilterRule>>,
    pub autoprovision: Option<Vec<AutoProvisionRule>>,
}

/// Exclude criteria for the nodes matching `hostname`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterRule {
    pub hostname: String,
    pub exclude_labels: Vec<String>,
    pub exclude_vendors: Vec<String>,
    pub exclude_devices: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub exclude_part_types: Vec<String>,
}

/// Device globs to auto-provision on the nodes matching `hostname`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoProvisionRule {
    pub hostname: String,
    pub devices: Vec<String>,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Filter criteria resolved for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    pub exclude_labels: Vec<String>,
    pub exclude_vendors: Vec<String>,
    pub exclude_devices: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub exclude_part_types: Vec<String>,
    pub auto_provision_devices: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exclude_labels: Vec::new(),
            // Volumes exported back to the node by the storage system itself
            exclude_vendors: vec!["longhorn".to_string(), "IET".to_string()],
            exclude_devices: Vec::new(),
            exclude_paths: vec!["/".to_string(), "/boot".to_string(), "/boot/efi".to_string()],
            exclude_part_types: Vec::new(),
            auto_provision_devices: Vec::new(),
        }
    }
}

impl FilterConfig {
    /// Resolve the configuration for `node` from the document at `path`
    pub fn load(path: Option<&Path>, node: &str, defaults: &FilterConfig) -> FilterConfig {
        let Some(path) = path else {
            return defaults.clone();
        };

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    "Filter config {} unavailable, using defaults: {}",
                    path.display(),
                    e
                );
                return defaults.clone();
            }
        };

        match serde_yaml::from_str::<FilterDocument>(&content) {
            Ok(doc) => Self::resolve(&doc, node, defaults),
            Err(e) => {
                warn!(
                    "Filter config {} is invalid, using defaults: {}",
                    path.display(),
                    e
                );
                defaults.clone()
            }
        }
    }

    /// Extend `defaults` with the document's rules for `node`
    pub fn resolve(doc: &FilterDocument, node: &str, defaults: &FilterConfig) -> FilterConfig {
        let mut config = defaults.clone();

        match &doc.filters {
            Some(rules) => {
                let rules: Vec<&FilterRule> = rules
                    .iter()
                    .filter(|r| host_matches(&r.hostname, node))
                    .collect();
                collect(&mut config.exclude_labels, &rules, |r| &r.exclude_labels);
                collect(&mut config.exclude_vendors, &rules, |r| &r.exclude_vendors);
                collect(&mut config.exclude_devices, &rules, |r| &r.exclude_devices);
                collect(&mut config.exclude_paths, &rules, |r| &r.exclude_paths);
                collect(&mut config.exclude_part_types, &rules, |r| &r.exclude_part_types);
            }
            None => debug!("No filters key in filter config, using defaults"),
        }

        match &doc.autoprovision {
            Some(rules) => {
                let rules: Vec<&AutoProvisionRule> = rules
                    .iter()
                    .filter(|r| host_matches(&r.hostname, node))
                    .collect();
                collect(&mut config.auto_provision_devices, &rules, |r| &r.devices);
            }
            None => debug!("No autoprovision key in filter config, using defaults"),
        }

        config
    }

    /// Build the filter set for this configuration
    pub fn filter_set(&self) -> FilterSet {
        FilterSet::new(
            vec![
                Filter::vendor(&self.exclude_vendors),
                Filter::label(&self.exclude_labels),
                Filter::device_path(&self.exclude_devices),
                Filter::mount_path(&self.exclude_paths),
                Filter::part_type(&self.exclude_part_types),
                Filter::DriveType,
            ],
            vec![Filter::device_path(&self.auto_provision_devices)],
        )
    }
}

/// `"*"`, exact name, or glob match
fn host_matches(pattern: &str, node: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == GLOBAL_HOST || pattern == node {
        return true;
    }
    match Pattern::new(pattern) {
        Ok(p) => p.matches(node),
        Err(e) => {
            warn!("Invalid hostname pattern {:?}: {}", pattern, e);
            false
        }
    }
}

/// Append one list across rules to `out`, first occurrence wins
fn collect<R>(out: &mut Vec<String>, rules: &[&R], field: impl Fn(&R) -> &Vec<String>) {
    for rule in rules {
        for value in field(*rule) {
            if !out.contains(value) {
                out.push(value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
filters:
  - hostname: "*"
    excludeLabels: ["COS_*"]
    excludeVendors: ["longhorn"]
  - hostname: "worker-*"
    excludeDevices: ["/dev/sdz"]
    excludeLabels: ["HARV_*", "COS_*"]
  - hostname: "control-1"
    excludeDevices: ["/dev/sda"]
autoprovision:
  - hostname: "worker-1"
    devices: ["/dev/sd[b-d]"]
"#;

    #[test]
    fn test_global_and_host_rules_are_additive() {
        let doc: FilterDocument = serde_yaml::from_str(DOC).unwrap();
        let config = FilterConfig::resolve(&doc, "worker-1", &FilterConfig::default());

        assert_eq!(config.exclude_labels, vec!["COS_*", "HARV_*"]);
        assert_eq!(config.exclude_vendors, vec!["longhorn", "IET"]);
        assert_eq!(config.exclude_devices, vec!["/dev/sdz"]);
        assert_eq!(config.exclude_paths, vec!["/", "/boot", "/boot/efi"]);
        assert_eq!(config.auto_provision_devices, vec!["/dev/sd[b-d]"]);

        let control = FilterConfig::resolve(&doc, "control-1", &FilterConfig::default());
        assert_eq!(control.exclude_devices, vec!["/dev/sda"]);
        assert!(control.auto_provision_devices.is_empty());
    }

    #[test]
    fn test_missing_key_keeps_defaults() {
        let doc: FilterDocument =
            serde_yaml::from_str("autoprovision:\n  - hostname: \"*\"\n    devices: [\"/dev/vd*\"]\n")
                .unwrap();
        let defaults = FilterConfig::default();
        let config = FilterConfig::resolve(&doc, "node-a", &defaults);

        assert_eq!(config.exclude_vendors, defaults.exclude_vendors);
        assert_eq!(config.exclude_paths, defaults.exclude_paths);
        assert_eq!(config.auto_provision_devices, vec!["/dev/vd*"]);
    }

    #[test]
    fn test_partial_rule_keeps_default_exclusions() {
        let doc: FilterDocument =
            serde_yaml::from_str("filters:\n  - hostname: \"*\"\n    excludeLabels: [\"COS_*\"]\n    excludePaths: [\"/data\"]\n")
                .unwrap();
        let config = FilterConfig::resolve(&doc, "node-a", &FilterConfig::default());

        assert_eq!(config.exclude_labels, vec!["COS_*"]);
        assert_eq!(config.exclude_vendors, vec!["longhorn", "IET"]);
        assert_eq!(config.exclude_paths, vec!["/", "/boot", "/boot/efi", "/data"]);
    }

    #[test]
    fn test_load_degrades_without_error() {
        let defaults = FilterConfig::default();
        assert_eq!(FilterConfig::load(None, "n", &defaults), defaults);

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert_eq!(FilterConfig::load(Some(&missing), "n", &defaults), defaults);

        let broken = dir.path().join("broken.yaml");
        fs::write(&broken, "filters: [ {hostname: ").unwrap();
        assert_eq!(FilterConfig::load(Some(&broken), "n", &defaults), defaults);

        let good = dir.path().join("filters.yaml");
        fs::write(&good, DOC).unwrap();
        let loaded = FilterConfig::load(Some(&good), "worker-2", &defaults);
        assert_eq!(loaded.exclude_devices, vec!["/dev/sdz"]);
    }

    #[test]
    fn test_host_matches() {
        assert!(host_matches("*", "anything"));
        assert!(host_matches("node-1", "node-1"));
        assert!(host_matches("node-?", "node-7"));
        assert!(!host_matches("node-?", "worker-7"));
        assert!(!host_matches("[", "node-1"));
    }

    #[test]
    fn test_filter_set_from_defaults() {
        let set = FilterConfig::default().filter_set();
        // vendor, mount path and drive type survive; empty lists are dropped
        assert_eq!(set.exclude.len(), 3);
        assert!(set.auto_provision.is_empty());
    }
}
