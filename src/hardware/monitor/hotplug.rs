//! Hot-plug Monitor
//!
//! Listens for block add/remove events and wakes the scanner. The monitor
//! never touches records itself. A failed socket is reopened after a short
//! delay; the process keeps running.

use super::uevent::{Uevent, UeventAction};
use crate::controlplane::metrics::AgentMetrics;
use crate::controlplane::waker::Waker;
use crate::domain::ports::{DeviceSource, UeventSource};
use crate::error::{Error, Result};
use crate::hardware::filter::FilterSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens a fresh event source for each monitor incarnation
pub type UeventSourceFactory = Arc<dyn Fn() -> Result<Box<dyn UeventSource>> + Send + Sync>;

/// Delay before a failed monitor is respawned
pub const DEFAULT_RESPAWN_DELAY: Duration = Duration::from_secs(5);

pub struct HotplugMonitor {
    open_source: UeventSourceFactory,
    devices: Arc<dyn DeviceSource>,
    filters: FilterSet,
    waker: Waker,
    metrics: Arc<AgentMetrics>,
    respawn_delay: Duration,
    inject_fault: AtomicBool,
    restarts: AtomicU64,
}

impl HotplugMonitor {
    pub fn new(
        open_source: UeventSourceFactory,
        devices: Arc<dyn DeviceSource>,
        filters: FilterSet,
        waker: Waker,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            open_source,
            devices,
            filters,
            waker,
            metrics,
            respawn_delay: DEFAULT_RESPAWN_DELAY,
            inject_fault: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn with_respawn_delay(mut self, delay: Duration) -> Self {
        self.respawn_delay = delay;
        self
    }

    /// Make the current incarnation fail once; the flag clears when it fires
    pub fn inject_fault(&self) {
        self.inject_fault.store(true, Ordering::SeqCst);
    }

    /// Number of times the monitor has been respawned
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Run until cancelled, respawning after every failure
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Hot-plug monitor started");
        loop {
            match self.run_once(&cancel).await {
                Ok(()) => break,
                Err(e) => {
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    self.metrics.monitor_restarts.inc();
                    warn!(
                        "Hot-plug monitor failed, respawning in {:?}: {}",
                        self.respawn_delay, e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.respawn_delay) => {}
                    }
                }
            }
        }
        info!("Hot-plug monitor stopped");
    }

    /// One incarnation: returns `Ok` only when cancelled
    async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        let mut source = (self.open_source)()?;
        loop {
            if self.inject_fault.swap(false, Ordering::SeqCst) {
                return Err(Error::InjectedFault);
            }

            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = source.next_event() => event?,
            };
            self.handle(&event).await;
        }
    }

    async fn handle(&self, event: &Uevent) {
        if !event.is_block_device() {
            return;
        }

        match event.action {
            UeventAction::Add => {
                let Some(name) = event.devname() else {
                    return;
                };
                if self.excluded(name, event.is_partition()).await {
                    debug!("Ignoring add of excluded device {}", name);
                    return;
                }
                debug!("Block device {} added, waking scanner", name);
                self.waker.wake();
            }
            UeventAction::Remove => {
                debug!("Block device {} removed, waking scanner", event.devpath);
                self.waker.wake();
            }
            _ => {}
        }
    }

    /// Apply the exclude filters to a freshly added device. A device the
    /// scanner cannot see yet is not excluded; the next pass decides.
    async fn excluded(&self, name: &str, is_partition: bool) -> bool {
        let disk = match self.devices.disk(name).await {
            Ok(Some(disk)) => disk,
            Ok(None) => return false,
            Err(e) => {
                warn!("Failed to inspect added device {}: {}", name, e);
                return false;
            }
        };

        if is_partition {
            disk.partitions
                .iter()
                .find(|p| p.name == name)
                .map(|p| self.filters.apply_exclude_partition(&disk, p))
                .unwrap_or(false)
        } else {
            self.filters.apply_exclude_disk(&disk)
        }
    }
}
