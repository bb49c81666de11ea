//! Block Device Scanner
//!
//! Enumerates disks and partitions from sysfs, enriches them from the udev
//! database and the mount table, and resolves persistent device paths.

use super::device::{DiskInfo, FilesystemInfo, PartitionInfo};
use super::mounts::MountTable;
use super::paths::KernelPaths;
use super::udev::UdevRecord;
use crate::crd::{DeviceStatus, DeviceType, DriveType};
use crate::domain::ports::DeviceSource;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the block device scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Include loopback devices
    pub include_loopback: bool,
    /// Include RAM disks
    pub include_ram: bool,
    /// Include device mapper devices
    pub include_dm: bool,
    /// Kernel truth sources
    pub paths: KernelPaths,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            include_loopback: false,
            include_ram: false,
            include_dm: false,
            paths: KernelPaths::default(),
        }
    }
}

// =============================================================================
// Block Scanner
// =============================================================================

/// Scans block devices on a Linux host
#[derive(Debug, Clone)]
pub struct BlockScanner {
    config: ScannerConfig,
}

impl BlockScanner {
    /// Create a new scanner
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Create a scanner with default configuration
    pub fn default_scanner() -> Self {
        Self::new(ScannerConfig::default())
    }

    pub fn paths(&self) -> &KernelPaths {
        &self.config.paths
    }

    /// Enumerate every included disk with its partitions
    pub fn scan_blocking(&self) -> Result<Vec<DiskInfo>> {
        let block_dir = self.config.paths.block_dir();
        if !block_dir.exists() {
            return Err(Error::HardwareDiscovery(format!(
                "Block device sysfs not found at {}",
                block_dir.display()
            )));
        }

        let mounts = match MountTable::load(&self.config.paths.mounts) {
            Ok(table) => table,
            Err(e) => {
                warn!(
                    "Failed to read mount table {}: {}",
                    self.config.paths.mounts.display(),
                    e
                );
                MountTable::default()
            }
        };

        let mut disks = Vec::new();
        for entry in fs::read_dir(&block_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            if !self.should_include_device(&name) {
                continue;
            }

            match self.scan_disk(&entry.path(), &name, &mounts) {
                Ok(disk) => disks.push(disk),
                Err(e) => warn!("Skipping block device {}: {}", name, e),
            }
        }

        disks.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Scanned {} block devices", disks.len());
        Ok(disks)
    }

    /// Scan a single whole disk
    fn scan_disk(&self, sysfs_path: &Path, name: &str, mounts: &MountTable) -> Result<DiskInfo> {
        let dev_path = format!("/dev/{}", name);
        let udev = self.udev_record(sysfs_path);

        let size_bytes = self.read_size(sysfs_path)?;
        let physical_block_size_bytes = self
            .read_sysfs_attr(sysfs_path, "queue/physical_block_size")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(512);

        let removable = self
            .read_sysfs_attr(sysfs_path, "removable")
            .map(|s| s.trim() == "1")
            .unwrap_or(false);

        let vendor = non_empty(udev.first_of(&["ID_VENDOR"]))
            .or_else(|| self.read_trimmed(sysfs_path, "device/vendor"))
            .unwrap_or_default();
        let model = non_empty(udev.first_of(&["ID_MODEL"]))
            .or_else(|| self.read_trimmed(sysfs_path, "device/model"))
            .unwrap_or_default();
        let serial_number = non_empty(udev.first_of(&["ID_SERIAL_SHORT", "ID_SERIAL"]))
            .or_else(|| self.read_trimmed(sysfs_path, "device/serial"))
            .unwrap_or_default();
        let wwn = non_empty(udev.first_of(&["ID_WWN_WITH_EXTENSION", "ID_WWN"]))
            .or_else(|| self.read_trimmed(sysfs_path, "device/wwid"))
            .unwrap_or_default();

        let partitions = self.scan_partitions(sysfs_path, name, mounts)?;

        Ok(DiskInfo {
            name: name.to_string(),
            file_system: self.filesystem(&udev, &dev_path, mounts),
            dev_path,
            size_bytes,
            physical_block_size_bytes,
            drive_type: self.detect_drive_type(name, sysfs_path),
            storage_controller: storage_controller(name).to_string(),
            bus_path: udev.first_of(&["ID_PATH"]),
            vendor,
            model,
            serial_number,
            wwn,
            ptable_uuid: udev.first_of(&["ID_PART_TABLE_UUID"]),
            removable,
            partitions,
        })
    }

    /// Partitions are subdirectories of the disk carrying a `partition` file
    fn scan_partitions(
        &self,
        disk_path: &Path,
        disk_name: &str,
        mounts: &MountTable,
    ) -> Result<Vec<PartitionInfo>> {
        let mut partitions = Vec::new();
        for entry in fs::read_dir(disk_path)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(disk_name) || !self.is_partition(&path) {
                continue;
            }

            let dev_path = format!("/dev/{}", name);
            let udev = self.udev_record(&path);
            let size_bytes = match self.read_size(&path) {
                Ok(size) => size,
                Err(e) => {
                    warn!("Skipping partition {}: {}", name, e);
                    continue;
                }
            };

            partitions.push(PartitionInfo {
                label: udev.first_of(&["ID_FS_LABEL", "ID_PART_ENTRY_NAME"]),
                part_type: udev.first_of(&["ID_PART_ENTRY_TYPE"]),
                part_uuid: udev.first_of(&["ID_PART_ENTRY_UUID"]),
                file_system: self.filesystem(&udev, &dev_path, mounts),
                name,
                dev_path,
                size_bytes,
            });
        }
        partitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(partitions)
    }

    fn filesystem(&self, udev: &UdevRecord, dev_path: &str, mounts: &MountTable) -> FilesystemInfo {
        let mount = mounts.find_device(dev_path);
        FilesystemInfo {
            mount_point: mount.map(|m| m.mount_point.clone()).unwrap_or_default(),
            fs_type: mount
                .map(|m| m.fs_type.clone())
                .or_else(|| non_empty(udev.first_of(&["ID_FS_TYPE"])))
                .unwrap_or_default(),
            is_read_only: mount.map(|m| m.is_read_only()).unwrap_or(false),
            uuid: udev.first_of(&["ID_FS_UUID"]),
            label: udev.first_of(&["ID_FS_LABEL"]),
        }
    }

    fn udev_record(&self, sysfs_path: &Path) -> UdevRecord {
        match self.read_sysfs_attr(sysfs_path, "dev") {
            Ok(major_minor) => UdevRecord::load(&self.config.paths.udev_data, major_minor.trim()),
            Err(_) => UdevRecord::default(),
        }
    }

    /// Size in bytes (sysfs reports 512-byte sectors)
    fn read_size(&self, sysfs_path: &Path) -> Result<u64> {
        let size_str = self.read_sysfs_attr(sysfs_path, "size")?;
        let sectors: u64 = size_str
            .trim()
            .parse()
            .map_err(|_| Error::HardwareDiscovery(format!("Invalid size: {}", size_str)))?;
        Ok(sectors * 512)
    }

    /// Detect the physical drive type
    fn detect_drive_type(&self, name: &str, sysfs_path: &Path) -> DriveType {
        if name.starts_with("sr") {
            return DriveType::Odd;
        }
        if name.starts_with("fd") {
            return DriveType::Fdd;
        }

        // Check rotational flag
        if let Ok(rotational) = self.read_sysfs_attr(sysfs_path, "queue/rotational") {
            if rotational.trim() == "0" {
                return DriveType::Ssd;
            } else if rotational.trim() == "1" {
                return DriveType::Hdd;
            }
        }

        DriveType::Unknown
    }

    /// Check if a path is a partition
    fn is_partition(&self, sysfs_path: &Path) -> bool {
        // Partitions have a "partition" file
        sysfs_path.join("partition").exists()
    }

    /// Check if a device should be included
    fn should_include_device(&self, name: &str) -> bool {
        // Skip loopback devices
        if !self.config.include_loopback && name.starts_with("loop") {
            return false;
        }

        // Skip RAM disks
        if !self.config.include_ram && (name.starts_with("ram") || name.starts_with("zram")) {
            return false;
        }

        // Skip device mapper
        if !self.config.include_dm && name.starts_with("dm-") {
            return false;
        }

        // Skip md RAID devices
        if name.starts_with("md") {
            return false;
        }

        true
    }

    /// Read a sysfs attribute
    fn read_sysfs_attr(&self, base_path: &Path, attr: &str) -> Result<String> {
        let path = base_path.join(attr);
        fs::read_to_string(&path).map_err(|e| {
            Error::HardwareDiscovery(format!("Failed to read {}: {}", path.display(), e))
        })
    }

    fn read_trimmed(&self, base_path: &Path, attr: &str) -> Option<String> {
        self.read_sysfs_attr(base_path, attr)
            .ok()
            .and_then(|s| non_empty(s.trim().to_string()))
    }

    // =========================================================================
    // Persistent Paths
    // =========================================================================

    /// Resolve a path for the device that survives kernel renames, on the
    /// blocking pool
    pub async fn resolve_persistent_path(&self, status: &DeviceStatus) -> Result<String> {
        let scanner = self.clone();
        let status = status.clone();
        tokio::task::spawn_blocking(move || scanner.resolve_persistent_path_blocking(&status))
            .await
            .map_err(|e| Error::Internal(format!("Path resolution task failed: {}", e)))?
    }

    /// Order: WWN symlink, filesystem-UUID symlink, partition-table-UUID
    /// lookup (disks), PARTUUID symlink (partitions). No candidate is an
    /// error rather than an empty path.
    pub fn resolve_persistent_path_blocking(&self, status: &DeviceStatus) -> Result<String> {
        let details = &status.details;
        let is_disk = details.device_type == DeviceType::Disk;

        if is_disk && !details.wwn.is_empty() {
            let candidate = format!("/dev/disk/by-id/wwn-{}", details.wwn);
            if self.link_exists(&candidate) {
                return Ok(candidate);
            }
        }

        if !details.fs_uuid.is_empty() {
            let candidate = format!("/dev/disk/by-uuid/{}", details.fs_uuid);
            if self.link_exists(&candidate) {
                return Ok(candidate);
            }
        }

        if is_disk && !details.ptable_uuid.is_empty() {
            let found = self
                .scan_blocking()?
                .into_iter()
                .find(|d| d.ptable_uuid == details.ptable_uuid);
            if let Some(disk) = found {
                return Ok(disk.dev_path);
            }
        }

        if !is_disk && !details.part_uuid.is_empty() {
            let candidate = format!("/dev/disk/by-partuuid/{}", details.part_uuid);
            if self.link_exists(&candidate) {
                return Ok(candidate);
            }
        }

        Err(Error::NoPersistentPath {
            device: status.dev_path.clone(),
        })
    }

    /// Whether a `/dev` entry (usually a udev symlink) exists
    pub fn link_exists(&self, dev_path: &str) -> bool {
        fs::symlink_metadata(self.config.paths.host_dev_path(dev_path)).is_ok()
    }

    /// Kernel device path a `/dev` symlink points at (e.g. by-id -> /dev/sdb),
    /// or the input when it cannot be resolved
    pub fn canonical_dev_path(&self, dev_path: &str) -> String {
        let dev_root = &self.config.paths.dev;
        fs::canonicalize(self.config.paths.host_dev_path(dev_path))
            .ok()
            .and_then(|target| {
                let root = fs::canonicalize(dev_root).unwrap_or_else(|_| dev_root.clone());
                target
                    .strip_prefix(&root)
                    .ok()
                    .map(|rel| format!("/dev/{}", rel.display()))
            })
            .unwrap_or_else(|| dev_path.to_string())
    }
}

#[async_trait]
impl DeviceSource for BlockScanner {
    async fn scan(&self) -> Result<Vec<DiskInfo>> {
        let scanner = self.clone();
        let disks = tokio::task::spawn_blocking(move || scanner.scan_blocking())
            .await
            .map_err(|e| Error::Internal(format!("Scan task failed: {}", e)))??;
        info!("Discovered {} disks", disks.len());
        Ok(disks)
    }

    async fn disk(&self, name: &str) -> Result<Option<DiskInfo>> {
        let disks = self.scan().await?;
        Ok(disks
            .into_iter()
            .find(|d| d.name == name || d.partitions.iter().any(|p| p.name == name)))
    }
}

/// Storage controller family from the kernel name
fn storage_controller(name: &str) -> &'static str {
    if name.starts_with("nvme") {
        "NVMe"
    } else if name.starts_with("vd") {
        "virtio"
    } else if name.starts_with("mmcblk") {
        "MMC"
    } else if name.starts_with("hd") {
        "IDE"
    } else if name.starts_with("sd") || name.starts_with("sr") {
        "SCSI"
    } else if name.starts_with("loop") {
        "loop"
    } else {
        "Unknown"
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Builds a fake host: sysfs block tree, udev database, mount table, /dev
    pub(crate) struct Fixture {
        pub dir: TempDir,
        pub paths: KernelPaths,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = KernelPaths::with_root(dir.path());
            fs::create_dir_all(paths.block_dir()).unwrap();
            fs::create_dir_all(&paths.udev_data).unwrap();
            fs::create_dir_all(paths.mounts.parent().unwrap()).unwrap();
            fs::create_dir_all(paths.dev.join("disk/by-id")).unwrap();
            fs::create_dir_all(paths.dev.join("disk/by-uuid")).unwrap();
            fs::create_dir_all(paths.dev.join("disk/by-partuuid")).unwrap();
            fs::write(&paths.mounts, "").unwrap();
            Self { dir, paths }
        }

        fn write(path: PathBuf, content: &str) {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        pub fn disk(&self, name: &str, major_minor: &str, rotational: bool, udev: &[(&str, &str)]) {
            let base = self.paths.block_dir().join(name);
            Self::write(base.join("size"), "7814037168\n");
            Self::write(base.join("dev"), major_minor);
            Self::write(base.join("removable"), "0\n");
            Self::write(base.join("queue/rotational"), if rotational { "1\n" } else { "0\n" });
            Self::write(base.join("queue/physical_block_size"), "4096\n");
            self.udev(major_minor, udev);
        }

        pub fn partition(&self, disk: &str, name: &str, major_minor: &str, udev: &[(&str, &str)]) {
            let base = self.paths.block_dir().join(disk).join(name);
            Self::write(base.join("size"), "2048\n");
            Self::write(base.join("dev"), major_minor);
            Self::write(base.join("partition"), "1\n");
            self.udev(major_minor, udev);
        }

        pub fn udev(&self, major_minor: &str, props: &[(&str, &str)]) {
            let content: String = props
                .iter()
                .map(|(k, v)| format!("E:{}={}\n", k, v))
                .collect();
            Self::write(self.paths.udev_data.join(format!("b{}", major_minor)), &content);
        }

        pub fn mounts(&self, content: &str) {
            fs::write(&self.paths.mounts, content).unwrap();
        }

        pub fn link(&self, dev_path: &str) {
            Self::write(self.paths.host_dev_path(dev_path), "");
        }

        pub fn scanner(&self) -> BlockScanner {
            BlockScanner::new(ScannerConfig {
                paths: self.paths.clone(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_should_include_device() {
        let scanner = BlockScanner::default_scanner();

        assert!(scanner.should_include_device("sda"));
        assert!(scanner.should_include_device("nvme0n1"));
        assert!(!scanner.should_include_device("loop0"));
        assert!(!scanner.should_include_device("ram0"));
        assert!(!scanner.should_include_device("zram0"));
        assert!(!scanner.should_include_device("dm-0"));
        assert!(!scanner.should_include_device("md0"));
    }

    #[test]
    fn test_storage_controller() {
        assert_eq!(storage_controller("nvme0n1"), "NVMe");
        assert_eq!(storage_controller("sdb"), "SCSI");
        assert_eq!(storage_controller("vda"), "virtio");
        assert_eq!(storage_controller("xyz"), "Unknown");
    }

    #[test]
    fn test_scan_disks_and_partitions() {
        let fx = Fixture::new();
        fx.disk(
            "sdb",
            "8:16",
            true,
            &[
                ("ID_VENDOR", "ATA"),
                ("ID_MODEL", "ST4000NM0035"),
                ("ID_SERIAL_SHORT", "ZC1ABCDE"),
                ("ID_WWN", "0x5000c500a1b2c3d4"),
                ("ID_PATH", "pci-0000:00:1f.2-ata-2"),
                ("ID_PART_TABLE_UUID", "pt-uuid-1"),
            ],
        );
        fx.partition(
            "sdb",
            "sdb1",
            "8:17",
            &[
                ("ID_FS_TYPE", "ext4"),
                ("ID_FS_UUID", "fs-uuid-1"),
                ("ID_FS_LABEL", "data"),
                ("ID_PART_ENTRY_UUID", "partuuid-1"),
                ("ID_PART_ENTRY_TYPE", "0fc63daf-8483-4772-8e79-3d69d8477de4"),
            ],
        );
        fx.disk("nvme0n1", "259:0", false, &[]);
        fx.disk("loop0", "7:0", false, &[]);
        fx.mounts("/dev/sdb1 /mnt/data ext4 ro,relatime 0 0\n");

        let disks = fx.scanner().scan_blocking().unwrap();
        assert_eq!(disks.len(), 2);

        let nvme = &disks[0];
        assert_eq!(nvme.name, "nvme0n1");
        assert_eq!(nvme.drive_type, DriveType::Ssd);
        assert_eq!(nvme.storage_controller, "NVMe");

        let sdb = &disks[1];
        assert_eq!(sdb.dev_path, "/dev/sdb");
        assert_eq!(sdb.size_bytes, 7814037168 * 512);
        assert_eq!(sdb.physical_block_size_bytes, 4096);
        assert_eq!(sdb.drive_type, DriveType::Hdd);
        assert_eq!(sdb.wwn, "0x5000c500a1b2c3d4");
        assert_eq!(sdb.bus_path, "pci-0000:00:1f.2-ata-2");
        assert_eq!(sdb.partitions.len(), 1);

        let part = &sdb.partitions[0];
        assert_eq!(part.dev_path, "/dev/sdb1");
        assert_eq!(part.label, "data");
        assert_eq!(part.part_uuid, "partuuid-1");
        assert_eq!(part.file_system.mount_point, "/mnt/data");
        assert!(part.file_system.is_read_only);
        assert_eq!(part.file_system.uuid, "fs-uuid-1");
    }

    #[test]
    fn test_missing_mount_table_degrades() {
        let fx = Fixture::new();
        fx.disk("sdc", "8:32", true, &[]);
        fs::remove_file(&fx.paths.mounts).unwrap();
        let disks = fx.scanner().scan_blocking().unwrap();
        assert_eq!(disks.len(), 1);
        assert!(disks[0].file_system.mount_point.is_empty());
    }

    #[test]
    fn test_resolve_persistent_path_order() {
        let fx = Fixture::new();
        fx.disk("sdb", "8:16", true, &[("ID_PART_TABLE_UUID", "pt-1")]);
        let scanner = fx.scanner();
        let disk = scanner.scan_blocking().unwrap().remove(0);

        let mut status = disk.device_status();
        status.details.wwn = "0x5000".into();
        status.details.fs_uuid = "fs-1".into();

        // Neither link exists: falls through to the partition-table lookup
        assert_eq!(scanner.resolve_persistent_path_blocking(&status).unwrap(), "/dev/sdb");

        fx.link("/dev/disk/by-uuid/fs-1");
        assert_eq!(
            scanner.resolve_persistent_path_blocking(&status).unwrap(),
            "/dev/disk/by-uuid/fs-1"
        );

        fx.link("/dev/disk/by-id/wwn-0x5000");
        assert_eq!(
            scanner.resolve_persistent_path_blocking(&status).unwrap(),
            "/dev/disk/by-id/wwn-0x5000"
        );
    }

    #[test]
    fn test_canonical_dev_path() {
        let fx = Fixture::new();
        fs::write(fx.paths.dev.join("sdb"), "").unwrap();
        std::os::unix::fs::symlink("../../sdb", fx.paths.dev.join("disk/by-id/wwn-0x5000")).unwrap();

        let scanner = fx.scanner();
        assert_eq!(scanner.canonical_dev_path("/dev/disk/by-id/wwn-0x5000"), "/dev/sdb");
        assert_eq!(scanner.canonical_dev_path("/dev/missing"), "/dev/missing");
    }

    #[tokio::test]
    async fn test_resolve_persistent_path_partition_and_error() {
        let fx = Fixture::new();
        let scanner = fx.scanner();
        let mut status = DeviceStatus::default();
        status.dev_path = "/dev/sdb1".into();
        status.details.device_type = DeviceType::Part;
        status.details.part_uuid = "pu-1".into();

        assert!(matches!(
            scanner.resolve_persistent_path(&status).await,
            Err(Error::NoPersistentPath { .. })
        ));

        fx.link("/dev/disk/by-partuuid/pu-1");
        assert_eq!(
            scanner.resolve_persistent_path(&status).await.unwrap(),
            "/dev/disk/by-partuuid/pu-1"
        );
    }
}
