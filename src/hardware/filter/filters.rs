//! Device Filters
//!
//! Named predicates over discovered disks and partitions. A device is
//! excluded when any exclude filter matches and is eligible for automatic
//! provisioning when any auto-provision filter matches.

use crate::crd::DriveType;
use crate::hardware::discovery::{DiskInfo, PartitionInfo};
use glob::Pattern;
use std::fmt;
use tracing::{debug, warn};

// =============================================================================
// Filter
// =============================================================================

/// A single filter predicate
#[derive(Debug, Clone)]
pub enum Filter {
    /// Device path glob (e.g. `/dev/sd*`)
    DevicePath(Vec<Pattern>),
    /// Vendor, compared case-insensitively
    Vendor(Vec<String>),
    /// Filesystem or partition label glob
    Label(Vec<Pattern>),
    /// Partition type GUID
    PartType(Vec<String>),
    /// Mount point equality
    MountPath(Vec<String>),
    /// Rejects anything that is neither HDD nor SSD
    DriveType,
}

impl Filter {
    pub fn device_path<S: AsRef<str>>(globs: &[S]) -> Self {
        Filter::DevicePath(compile(globs))
    }

    pub fn vendor<S: AsRef<str>>(vendors: &[S]) -> Self {
        Filter::Vendor(owned(vendors))
    }

    pub fn label<S: AsRef<str>>(globs: &[S]) -> Self {
        Filter::Label(compile(globs))
    }

    pub fn part_type<S: AsRef<str>>(types: &[S]) -> Self {
        Filter::PartType(owned(types))
    }

    pub fn mount_path<S: AsRef<str>>(paths: &[S]) -> Self {
        Filter::MountPath(owned(paths))
    }

    /// Filter name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Filter::DevicePath(_) => "device path filter",
            Filter::Vendor(_) => "vendor filter",
            Filter::Label(_) => "label filter",
            Filter::PartType(_) => "partition type filter",
            Filter::MountPath(_) => "mount path filter",
            Filter::DriveType => "drive type filter",
        }
    }

    /// Whether the filter has anything to match against
    pub fn is_empty(&self) -> bool {
        match self {
            Filter::DevicePath(p) | Filter::Label(p) => p.is_empty(),
            Filter::Vendor(v) | Filter::PartType(v) | Filter::MountPath(v) => v.is_empty(),
            Filter::DriveType => false,
        }
    }

    /// Match a whole disk
    ///
    /// Label filters match when the disk's own label matches or when every
    /// partition matches; path, partition type and mount filters match when
    /// any partition does.
    pub fn match_disk(&self, disk: &DiskInfo) -> bool {
        match self {
            Filter::DevicePath(patterns) => {
                glob_any(patterns, &disk.dev_path)
                    || disk
                        .partitions
                        .iter()
                        .any(|p| glob_any(patterns, &p.dev_path))
            }
            Filter::Vendor(vendors) => vendor_matches(vendors, &disk.vendor),
            Filter::Label(patterns) => {
                let own = glob_any(patterns, &disk.file_system.label);
                let all_partitions = !disk.partitions.is_empty()
                    && disk
                        .partitions
                        .iter()
                        .all(|p| glob_any(patterns, &p.label));
                own || all_partitions
            }
            Filter::PartType(types) => disk
                .partitions
                .iter()
                .any(|p| eq_any(types, &p.part_type)),
            Filter::MountPath(paths) => {
                eq_any(paths, &disk.file_system.mount_point)
                    || disk
                        .partitions
                        .iter()
                        .any(|p| eq_any(paths, &p.file_system.mount_point))
            }
            Filter::DriveType => !drive_type_supported(disk.drive_type),
        }
    }

    /// Match one partition of `disk`
    pub fn match_partition(&self, disk: &DiskInfo, part: &PartitionInfo) -> bool {
        match self {
            Filter::DevicePath(patterns) => glob_any(patterns, &part.dev_path),
            Filter::Vendor(vendors) => vendor_matches(vendors, &disk.vendor),
            Filter::Label(patterns) => glob_any(patterns, &part.label),
            Filter::PartType(types) => eq_any(types, &part.part_type),
            Filter::MountPath(paths) => eq_any(paths, &part.file_system.mount_point),
            Filter::DriveType => !drive_type_supported(disk.drive_type),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn drive_type_supported(drive_type: DriveType) -> bool {
    matches!(drive_type, DriveType::Hdd | DriveType::Ssd)
}

fn compile<S: AsRef<str>>(globs: &[S]) -> Vec<Pattern> {
    globs
        .iter()
        .filter_map(|g| match Pattern::new(g.as_ref()) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Ignoring invalid filter pattern {:?}: {}", g.as_ref(), e);
                None
            }
        })
        .collect()
}

fn owned<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.as_ref().trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn glob_any(patterns: &[Pattern], value: &str) -> bool {
    !value.is_empty() && patterns.iter().any(|p| p.matches(value))
}

fn eq_any(values: &[String], value: &str) -> bool {
    !value.is_empty() && values.iter().any(|v| v.eq_ignore_ascii_case(value))
}

/// Case-insensitive substring match, so `longhorn` also covers `LONGHORN-SIM`
fn vendor_matches(vendors: &[String], vendor: &str) -> bool {
    let vendor = vendor.trim().to_ascii_lowercase();
    !vendor.is_empty()
        && vendors
            .iter()
            .any(|v| vendor.contains(&v.to_ascii_lowercase()))
}

// =============================================================================
// Filter Set
// =============================================================================

/// Ordered exclude and auto-provision filter lists
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    pub exclude: Vec<Filter>,
    pub auto_provision: Vec<Filter>,
}

impl FilterSet {
    pub fn new(exclude: Vec<Filter>, auto_provision: Vec<Filter>) -> Self {
        Self {
            exclude: exclude.into_iter().filter(|f| !f.is_empty()).collect(),
            auto_provision: auto_provision.into_iter().filter(|f| !f.is_empty()).collect(),
        }
    }

    /// Whether the disk is excluded from management
    pub fn apply_exclude_disk(&self, disk: &DiskInfo) -> bool {
        match self.exclude.iter().find(|f| f.match_disk(disk)) {
            Some(filter) => {
                debug!("Disk {} excluded by {}", disk.dev_path, filter);
                true
            }
            None => false,
        }
    }

    /// Whether a partition of `disk` is excluded from management
    pub fn apply_exclude_partition(&self, disk: &DiskInfo, part: &PartitionInfo) -> bool {
        match self.exclude.iter().find(|f| f.match_partition(disk, part)) {
            Some(filter) => {
                debug!("Partition {} excluded by {}", part.dev_path, filter);
                true
            }
            None => false,
        }
    }

    /// Whether the disk should be provisioned without an explicit request
    pub fn apply_auto_provision(&self, disk: &DiskInfo) -> bool {
        self.auto_provision.iter().any(|f| f.match_disk(disk))
    }
}
