//! Kernel uevents
//!
//! Parsing of `NETLINK_KOBJECT_UEVENT` messages and the netlink socket that
//! delivers them. A kernel message is a header `ACTION@DEVPATH` followed by
//! NUL-separated `KEY=VALUE` pairs.

use crate::domain::ports::UeventSource;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;

/// Kernel multicast group for uevents
const KERNEL_GROUP: u32 = 1;

/// Receive buffer size; uevents are bounded by the kernel at a few KiB
const BUFFER_SIZE: usize = 8192;

// =============================================================================
// Uevent
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
    Change,
    Other(String),
}

impl From<&str> for UeventAction {
    fn from(action: &str) -> Self {
        match action {
            "add" => UeventAction::Add,
            "remove" => UeventAction::Remove,
            "change" => UeventAction::Change,
            other => UeventAction::Other(other.to_string()),
        }
    }
}

impl fmt::Display for UeventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UeventAction::Add => write!(f, "add"),
            UeventAction::Remove => write!(f, "remove"),
            UeventAction::Change => write!(f, "change"),
            UeventAction::Other(s) => write!(f, "{}", s),
        }
    }
}

/// One kernel hardware event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: UeventAction,
    pub devpath: String,
    pub properties: HashMap<String, String>,
}

impl Uevent {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.get("SUBSYSTEM")
    }

    pub fn devtype(&self) -> Option<&str> {
        self.get("DEVTYPE")
    }

    /// Kernel device name (e.g. sdb1)
    pub fn devname(&self) -> Option<&str> {
        self.get("DEVNAME")
            .map(|n| n.trim_start_matches("/dev/"))
            .or_else(|| self.devpath.rsplit('/').next())
            .filter(|n| !n.is_empty())
    }

    /// Block disk or partition event
    pub fn is_block_device(&self) -> bool {
        self.subsystem() == Some("block") && matches!(self.devtype(), Some("disk" | "partition"))
    }

    pub fn is_partition(&self) -> bool {
        self.devtype() == Some("partition")
    }
}

/// Parse one kernel uevent message; `None` for anything else (e.g. the
/// udev daemon's own rebroadcasts, which start with `libudev`)
pub fn parse_uevent(bytes: &[u8]) -> Option<Uevent> {
    let mut fields = bytes
        .split(|b| *b == 0)
        .filter(|f| !f.is_empty())
        .map(String::from_utf8_lossy);

    let header = fields.next()?;
    let (action, devpath) = header.split_once('@')?;
    if action.is_empty() || devpath.is_empty() {
        return None;
    }

    let properties: HashMap<String, String> = fields
        .filter_map(|f| {
            f.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    let action = properties
        .get("ACTION")
        .map(|a| UeventAction::from(a.as_str()))
        .unwrap_or_else(|| UeventAction::from(action));

    Some(Uevent {
        action,
        devpath: devpath.to_string(),
        properties,
    })
}

// =============================================================================
// Netlink Source
// =============================================================================

/// Kernel uevent socket
pub struct NetlinkSource {
    fd: AsyncFd<OwnedFd>,
    buf: Vec<u8>,
}

impl NetlinkSource {
    /// Open and bind a uevent socket; must be called inside a runtime
    pub fn open() -> Result<Self> {
        // SAFETY: plain socket(2); the result is checked before use
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(socket_error("socket", io::Error::last_os_error()));
        }
        // SAFETY: raw is a freshly created descriptor owned by nothing else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain data; all-zero is a valid value
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = KERNEL_GROUP;

        // SAFETY: addr outlives the call and the length matches its type
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(socket_error("bind", io::Error::last_os_error()));
        }

        let fd = AsyncFd::new(fd).map_err(|e| socket_error("register", e))?;
        Ok(Self {
            fd,
            buf: vec![0; BUFFER_SIZE],
        })
    }
}

#[async_trait]
impl UeventSource for NetlinkSource {
    async fn next_event(&mut self) -> Result<Uevent> {
        let Self { fd, buf } = self;
        loop {
            let mut guard = fd.readable().await.map_err(|e| socket_error("poll", e))?;
            let received = guard.try_io(|inner| {
                // SAFETY: buf is valid for buf.len() bytes for the whole call
                let n = unsafe {
                    libc::recv(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });

            match received {
                Ok(Ok(n)) => {
                    if let Some(event) = parse_uevent(&buf[..n]) {
                        return Ok(event);
                    }
                }
                Ok(Err(e)) => return Err(socket_error("recv", e)),
                Err(_would_block) => continue,
            }
        }
    }
}

fn socket_error(op: &str, e: io::Error) -> Error {
    Error::MonitorSocket(format!("{}: {}", op, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn test_parse_partition_add() {
        let bytes = message(&[
            "add@/devices/pci0000:00/0000:00:1f.2/ata2/host1/target1:0:0/1:0:0:0/block/sdb/sdb1",
            "ACTION=add",
            "DEVPATH=/devices/pci0000:00/0000:00:1f.2/ata2/host1/target1:0:0/1:0:0:0/block/sdb/sdb1",
            "SUBSYSTEM=block",
            "DEVNAME=sdb1",
            "DEVTYPE=partition",
            "SEQNUM=4242",
        ]);

        let event = parse_uevent(&bytes).unwrap();
        assert_eq!(event.action, UeventAction::Add);
        assert!(event.is_block_device());
        assert!(event.is_partition());
        assert_eq!(event.devname(), Some("sdb1"));
        assert_eq!(event.get("SEQNUM"), Some("4242"));
    }

    #[test]
    fn test_parse_remove_without_devname() {
        let bytes = message(&[
            "remove@/devices/virtual/block/sdc",
            "SUBSYSTEM=block",
            "DEVTYPE=disk",
        ]);
        let event = parse_uevent(&bytes).unwrap();
        assert_eq!(event.action, UeventAction::Remove);
        assert_eq!(event.devname(), Some("sdc"));
        assert!(!event.is_partition());
    }

    #[test]
    fn test_non_block_and_garbage() {
        let usb = parse_uevent(&message(&["add@/devices/usb1", "SUBSYSTEM=usb"])).unwrap();
        assert!(!usb.is_block_device());

        assert!(parse_uevent(b"libudev\0\xfe\xed").is_none());
        assert!(parse_uevent(b"").is_none());
        assert!(parse_uevent(b"@/devices\0").is_none());
    }
}
