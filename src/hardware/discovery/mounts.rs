//! Mount table
//!
//! Parses `/proc/mounts`-format tables to answer "where is this device
//! mounted, with which filesystem, read-only or not".

use crate::error::Result;
use std::fs;
use std::path::Path;

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Parsed mount table
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = unescape(fields.next()?);
                let mount_point = unescape(fields.next()?);
                let fs_type = fields.next()?.to_string();
                let options = fields
                    .next()
                    .map(|o| o.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
                Some(MountEntry {
                    device,
                    mount_point,
                    fs_type,
                    options,
                })
            })
            .collect();
        Self { entries }
    }

    /// First mount of a device
    pub fn find_device(&self, dev_path: &str) -> Option<&MountEntry> {
        self.entries.iter().find(|e| e.device == dev_path)
    }

    /// Whether anything is mounted at `mount_point`
    pub fn is_mount_point(&self, mount_point: &str) -> bool {
        self.entries.iter().any(|e| e.mount_point == mount_point)
    }
}

/// Undo the octal escaping the kernel applies to spaces, tabs and newlines
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|octal| u8::from_str_radix(octal, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
/dev/sda2 / ext4 rw,relatime 0 0
/dev/sdb1 /var/lib/extra\\040disks/abc ext4 ro,relatime 0 0
tmpfs /run tmpfs rw,nosuid 0 0
";

    #[test]
    fn test_find_device() {
        let table = MountTable::parse(SAMPLE);
        let entry = table.find_device("/dev/sdb1").unwrap();
        assert_eq!(entry.mount_point, "/var/lib/extra disks/abc");
        assert_eq!(entry.fs_type, "ext4");
        assert!(entry.is_read_only());

        let root = table.find_device("/dev/sda2").unwrap();
        assert!(!root.is_read_only());
        assert!(table.find_device("/dev/sdc").is_none());
        assert!(table.is_mount_point("/run"));
    }

    #[test]
    fn test_unescape_passthrough() {
        assert_eq!(unescape("/mnt/plain"), "/mnt/plain");
        assert_eq!(unescape("/mnt/a\\011b"), "/mnt/a\tb");
    }
}
