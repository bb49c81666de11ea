//! Device Identity
//!
//! Content-derived GUIDs that survive reboots, renames and hot-plug. The
//! derivation is a compatibility contract with other tooling: the inputs,
//! their order and the digest must not change.
//!
//! - Disk: `digest(node + WWN + vendor + model + serial)`; without a WWN,
//!   `digest(node + filesystem UUID)`, then `digest(node + partition-table
//!   UUID)`.
//! - Partition: `digest(node + PARTUUID)`, then `digest(node + filesystem
//!   UUID)`.
//!
//! The digest is a 128-bit keyed BLAKE3 hash rendered as 32 hex characters,
//! which is also a valid record name.

use super::device::{DiskInfo, PartitionInfo};

/// Key for the identity digest
const IDENTITY_KEY: &[u8; 32] = b"storage.billyronks.io/device-id!";

/// Values some firmware reports instead of leaving a field empty
const PLACEHOLDERS: [&str; 3] = ["unknown", "0x0000000000000000", "none"];

/// 128-bit keyed digest of `input`, lowercase hex
pub fn digest(input: &str) -> String {
    let hash = blake3::keyed_hash(IDENTITY_KEY, input.as_bytes());
    hex::encode(&hash.as_bytes()[..16])
}

/// Whether an identity field carries a real value
pub fn present(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && !PLACEHOLDERS.iter().any(|p| value.eq_ignore_ascii_case(p))
}

/// GUID of a disk, or `None` when the disk carries no stable identifier
pub fn disk_guid(node: &str, disk: &DiskInfo) -> Option<String> {
    if present(&disk.wwn) {
        return Some(digest(&format!(
            "{}{}{}{}{}",
            node, disk.wwn, disk.vendor, disk.model, disk.serial_number
        )));
    }
    if present(&disk.file_system.uuid) {
        return Some(digest(&format!("{}{}", node, disk.file_system.uuid)));
    }
    if present(&disk.ptable_uuid) {
        return Some(digest(&format!("{}{}", node, disk.ptable_uuid)));
    }
    None
}

/// GUID of a partition, or `None` when it carries no stable identifier
pub fn partition_guid(node: &str, part: &PartitionInfo) -> Option<String> {
    if present(&part.part_uuid) {
        return Some(digest(&format!("{}{}", node, part.part_uuid)));
    }
    if present(&part.file_system.uuid) {
        return Some(digest(&format!("{}{}", node, part.file_system.uuid)));
    }
    None
}
