//! Kernel Truth Source Paths
//!
//! Where the agent reads block topology, the udev runtime database and the
//! mount table from. Inside a container the host's view is usually mounted
//! under a prefix; [`KernelPaths::with_root`] remaps every source at once.

use std::path::{Path, PathBuf};

/// Locations of the kernel-exposed device state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPaths {
    /// sysfs mount (contains `block/`)
    pub sysfs: PathBuf,
    /// udev runtime database (`b<major>:<minor>` files)
    pub udev_data: PathBuf,
    /// Mount table in /proc/mounts format
    pub mounts: PathBuf,
    /// devtmpfs root, used to check persistent symlinks
    pub dev: PathBuf,
}

impl Default for KernelPaths {
    fn default() -> Self {
        Self {
            sysfs: PathBuf::from("/sys"),
            udev_data: PathBuf::from("/run/udev/data"),
            mounts: PathBuf::from("/proc/self/mounts"),
            dev: PathBuf::from("/dev"),
        }
    }
}

impl KernelPaths {
    /// Remap every source under `root` (e.g. "/host"). The mount table is
    /// taken from PID 1 so it reflects the host mount namespace.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            sysfs: root.join("sys"),
            udev_data: root.join("run/udev/data"),
            mounts: root.join("proc/1/mounts"),
            dev: root.join("dev"),
        }
    }

    /// Directory listing the kernel's whole disks
    pub fn block_dir(&self) -> PathBuf {
        self.sysfs.join("block")
    }

    /// Map a host device path (`/dev/...`) onto the configured dev root
    pub fn host_dev_path(&self, dev_path: &str) -> PathBuf {
        let relative = dev_path.strip_prefix("/dev/").unwrap_or(dev_path);
        self.dev.join(relative.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_root() {
        let paths = KernelPaths::with_root("/host");
        assert_eq!(paths.sysfs, PathBuf::from("/host/sys"));
        assert_eq!(paths.mounts, PathBuf::from("/host/proc/1/mounts"));
        assert_eq!(
            paths.host_dev_path("/dev/disk/by-id/wwn-0x5000"),
            PathBuf::from("/host/dev/disk/by-id/wwn-0x5000")
        );
    }
}
