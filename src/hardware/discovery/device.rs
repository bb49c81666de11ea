//! Discovered Device Shapes
//!
//! What the scanner reports for each disk and partition, and how that maps
//! onto the observed part of a BlockDevice record.

use crate::crd::{
    DeviceCapacity, DeviceDetails, DeviceStatus, DeviceType, DriveType, FilesystemStatus,
};
use serde::{Deserialize, Serialize};

/// Filesystem found on a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub mount_point: String,
    pub fs_type: String,
    pub is_read_only: bool,
    pub uuid: String,
    pub label: String,
}

/// A whole disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Kernel name (e.g. sdb, nvme0n1)
    pub name: String,
    /// Device path (e.g. /dev/sdb)
    pub dev_path: String,
    pub size_bytes: u64,
    pub physical_block_size_bytes: u64,
    pub drive_type: DriveType,
    pub storage_controller: String,
    pub bus_path: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    pub wwn: String,
    pub ptable_uuid: String,
    pub removable: bool,
    pub file_system: FilesystemInfo,
    pub partitions: Vec<PartitionInfo>,
}

/// A partition on a disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub dev_path: String,
    pub size_bytes: u64,
    /// Partition entry label (GPT name) or filesystem label
    pub label: String,
    /// Partition type GUID
    pub part_type: String,
    /// PARTUUID
    pub part_uuid: String,
    pub file_system: FilesystemInfo,
}

impl DiskInfo {
    /// Observed record status for this disk
    pub fn device_status(&self) -> DeviceStatus {
        DeviceStatus {
            dev_path: self.dev_path.clone(),
            parent_device: None,
            partitioned: false,
            child_part_uuid: String::new(),
            capacity: DeviceCapacity {
                size_bytes: self.size_bytes,
                physical_block_size_bytes: self.physical_block_size_bytes,
            },
            details: DeviceDetails {
                device_type: DeviceType::Disk,
                drive_type: self.drive_type,
                storage_controller: self.storage_controller.clone(),
                bus_path: self.bus_path.clone(),
                vendor: self.vendor.clone(),
                model: self.model.clone(),
                serial_number: self.serial_number.clone(),
                wwn: self.wwn.clone(),
                ptable_uuid: self.ptable_uuid.clone(),
                fs_uuid: self.file_system.uuid.clone(),
                part_uuid: String::new(),
                part_type: String::new(),
                label: self.file_system.label.clone(),
                removable: self.removable,
            },
            file_system: self.file_system.observed(),
        }
    }

    /// Observed record status for one of this disk's partitions
    ///
    /// Partitions inherit the hardware details of their disk except the WWN
    /// and partition-table UUID, which identify the disk itself.
    pub fn partition_status(&self, part: &PartitionInfo) -> DeviceStatus {
        let mut status = self.device_status();
        status.dev_path = part.dev_path.clone();
        status.parent_device = Some(self.dev_path.clone());
        status.capacity.size_bytes = part.size_bytes;
        status.details.device_type = DeviceType::Part;
        status.details.wwn = String::new();
        status.details.ptable_uuid = String::new();
        status.details.fs_uuid = part.file_system.uuid.clone();
        status.details.part_uuid = part.part_uuid.clone();
        status.details.part_type = part.part_type.clone();
        status.details.label = part.label.clone();
        status.file_system = part.file_system.observed();
        status
    }
}

impl FilesystemInfo {
    fn observed(&self) -> FilesystemStatus {
        FilesystemStatus {
            mount_point: self.mount_point.clone(),
            r#type: self.fs_type.clone(),
            is_read_only: self.is_read_only,
            corrupted: false,
            last_formatted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_status_inherits_disk_details() {
        let disk = DiskInfo {
            name: "sdb".into(),
            dev_path: "/dev/sdb".into(),
            size_bytes: 4_000_000_000_000,
            vendor: "ATA".into(),
            model: "ST4000".into(),
            wwn: "0x5000".into(),
            ptable_uuid: "pt-1".into(),
            drive_type: DriveType::Hdd,
            ..Default::default()
        };
        let part = PartitionInfo {
            name: "sdb1".into(),
            dev_path: "/dev/sdb1".into(),
            size_bytes: 3_999_000_000_000,
            part_uuid: "partuuid-1".into(),
            ..Default::default()
        };

        let status = disk.partition_status(&part);
        assert_eq!(status.parent_device.as_deref(), Some("/dev/sdb"));
        assert_eq!(status.details.device_type, DeviceType::Part);
        assert_eq!(status.details.vendor, "ATA");
        assert_eq!(status.details.drive_type, DriveType::Hdd);
        assert!(status.details.wwn.is_empty());
        assert!(status.details.ptable_uuid.is_empty());
        assert_eq!(status.details.part_uuid, "partuuid-1");
    }
}
