//! udev runtime database reader
//!
//! udevd persists the properties of every device it processed under
//! `/run/udev/data/b<major>:<minor>`. Property lines look like
//! `E:ID_SERIAL_SHORT=S4EVNF0M`, symlink lines like `S:disk/by-id/wwn-0x5`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Properties of one device from the udev database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdevRecord {
    properties: HashMap<String, String>,
    /// Symlinks relative to /dev
    pub links: Vec<String>,
}

impl UdevRecord {
    /// Parse the contents of a database file
    pub fn parse(content: &str) -> Self {
        let mut record = Self::default();
        for line in content.lines() {
            if let Some(prop) = line.strip_prefix("E:") {
                if let Some((key, value)) = prop.split_once('=') {
                    record.properties.insert(key.to_string(), value.to_string());
                }
            } else if let Some(link) = line.strip_prefix("S:") {
                record.links.push(link.to_string());
            }
        }
        record
    }

    /// Load the record for a `major:minor` pair; a missing file is an empty
    /// record (udev may not have processed the device yet)
    pub fn load(udev_data: &Path, major_minor: &str) -> Self {
        let path = udev_data.join(format!("b{}", major_minor));
        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                debug!("No udev data at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Non-empty property value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// First present property among `keys`, or empty
    pub fn first_of(&self, keys: &[&str]) -> String {
        keys.iter()
            .find_map(|k| self.get(k))
            .unwrap_or_default()
            .to_string()
    }
}
