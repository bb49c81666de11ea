//! Agent - composition root
//!
//! Wires the record stores, host tooling and kernel sources into the
//! scanner, executor and hot-plug monitor, and owns their lifetime.

use crate::controlplane::context::{ProvisionerContext, DEFAULT_FORMAT_CONCURRENCY};
use crate::controlplane::executor::EffectExecutor;
use crate::controlplane::metrics::AgentMetrics;
use crate::controlplane::scanner::{Scanner, ScannerSettings, DEFAULT_SCAN_INTERVAL};
use crate::controlplane::waker::Waker;
use crate::crd::{BlockDevice, LonghornNode, LvmVolumeGroup, ProvisionerSpec};
use crate::domain::ports::{DiskOps, LvmOps, RecordStore, UeventSource};
use crate::error::{Error, Result};
use crate::hardware::discovery::{BlockScanner, KernelPaths, ScannerConfig};
use crate::hardware::filter::FilterConfig;
use crate::hardware::monitor::{HotplugMonitor, NetlinkSource, UeventSourceFactory};
use crate::hardware::SystemDiskOps;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node this agent manages
    pub node_name: String,
    /// Namespace of the agent's own records
    pub namespace: String,
    /// Namespace of Longhorn's node records
    pub longhorn_namespace: String,
    pub scan_interval: Duration,
    /// Delay before retrying a step whose backend is not ready
    pub requeue_delay: Duration,
    /// Concurrent filesystem formats
    pub format_concurrency: usize,
    /// Mount root for auto-provisioned disks
    pub mount_root: String,
    /// Prefix under which the host's /sys, /run/udev, /proc and /dev live
    pub kernel_root: Option<PathBuf>,
    /// Filter document; defaults apply when absent
    pub filter_config: Option<PathBuf>,
    pub default_filters: FilterConfig,
    /// Listen for kernel hot-plug events
    pub hotplug: bool,
    /// Backend for auto-provisioned disks
    pub default_provisioner: ProvisionerSpec,
    /// Run disk tooling in the host mount namespace
    pub host_namespace: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            namespace: "node-disk-agent".to_string(),
            longhorn_namespace: "longhorn-system".to_string(),
            scan_interval: DEFAULT_SCAN_INTERVAL,
            requeue_delay: Duration::from_secs(5),
            format_concurrency: DEFAULT_FORMAT_CONCURRENCY,
            mount_root: ScannerSettings::default().mount_root,
            kernel_root: None,
            filter_config: None,
            default_filters: FilterConfig::default(),
            hotplug: true,
            default_provisioner: ProvisionerSpec::Filesystem,
            host_namespace: false,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Configuration("node name is required".into()));
        }
        if self.scan_interval.is_zero() {
            return Err(Error::Configuration("scan interval must be positive".into()));
        }
        Ok(())
    }

    fn kernel_paths(&self) -> KernelPaths {
        self.kernel_root
            .as_ref()
            .map(KernelPaths::with_root)
            .unwrap_or_default()
    }
}

/// Parse a provisioner selector: `filesystem`, `raw-block[:<driver>]` or
/// `volume-group:<vg>[:<vgcreate parameters>]`
pub fn parse_provisioner(value: &str) -> Result<ProvisionerSpec> {
    let mut parts = value.splitn(3, ':');
    let kind = parts.next().unwrap_or_default().trim();
    match kind {
        "filesystem" => Ok(ProvisionerSpec::Filesystem),
        "raw-block" => Ok(ProvisionerSpec::RawBlock {
            disk_driver: parts.next().unwrap_or_default().to_string(),
        }),
        "volume-group" => match parts.next().filter(|vg| !vg.is_empty()) {
            Some(vg_name) => Ok(ProvisionerSpec::VolumeGroup {
                vg_name: vg_name.to_string(),
                parameters: parts.next().map(str::to_string),
            }),
            None => Err(Error::UnknownProvisioner(format!(
                "{} (volume group name missing)",
                value
            ))),
        },
        _ => Err(Error::UnknownProvisioner(value.to_string())),
    }
}

// =============================================================================
// Dependencies
// =============================================================================

/// External collaborators of the agent
pub struct AgentDeps {
    pub devices: Arc<dyn RecordStore<BlockDevice>>,
    pub longhorn_nodes: Arc<dyn RecordStore<LonghornNode>>,
    pub volume_groups: Arc<dyn RecordStore<LvmVolumeGroup>>,
    pub disk_ops: Arc<dyn DiskOps>,
    pub lvm_ops: Arc<dyn LvmOps>,
    pub uevents: UeventSourceFactory,
}

impl AgentDeps {
    /// Host tooling and the kernel netlink socket over the given stores
    pub fn host(
        devices: Arc<dyn RecordStore<BlockDevice>>,
        longhorn_nodes: Arc<dyn RecordStore<LonghornNode>>,
        volume_groups: Arc<dyn RecordStore<LvmVolumeGroup>>,
        host_namespace: bool,
    ) -> Self {
        let ops = Arc::new(SystemDiskOps::new(host_namespace));
        Self {
            devices,
            longhorn_nodes,
            volume_groups,
            disk_ops: ops.clone(),
            lvm_ops: ops,
            uevents: Arc::new(|| Ok(Box::new(NetlinkSource::open()?) as Box<dyn UeventSource>)),
        }
    }
}

// =============================================================================
// Agent
// =============================================================================

/// A running agent
pub struct Agent {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    effects: TaskTracker,
    monitor: Option<Arc<HotplugMonitor>>,
}

impl Agent {
    /// Build every component and start the scanner and monitor tasks
    pub async fn start(config: AgentConfig, deps: AgentDeps, metrics: Arc<AgentMetrics>) -> Result<Self> {
        config.validate()?;
        info!("Starting node disk agent on {}", config.node_name);

        let block_scanner = BlockScanner::new(ScannerConfig {
            paths: config.kernel_paths(),
            ..Default::default()
        });

        let ctx = Arc::new(ProvisionerContext::new(
            config.node_name.clone(),
            deps.devices,
            deps.longhorn_nodes,
            deps.volume_groups,
            deps.disk_ops,
            deps.lvm_ops,
            block_scanner.clone(),
            config.format_concurrency,
            config.requeue_delay,
        ));

        let filters = FilterConfig::load(
            config.filter_config.as_deref(),
            &config.node_name,
            &config.default_filters,
        )
        .filter_set();

        let cancel = CancellationToken::new();
        let waker = Waker::new();
        let executor = EffectExecutor::new(ctx.clone(), waker.clone(), metrics.clone(), cancel.clone());
        let effects = executor.tracker().clone();
        let source = Arc::new(block_scanner);

        let scanner = Arc::new(Scanner::new(
            ctx,
            source.clone(),
            filters.clone(),
            executor,
            waker.clone(),
            metrics.clone(),
            ScannerSettings {
                scan_interval: config.scan_interval,
                mount_root: config.mount_root.clone(),
                default_provisioner: config.default_provisioner.clone(),
            },
        ));

        let mut handles = Vec::new();
        let scan_cancel = cancel.clone();
        handles.push(tokio::spawn(async move { scanner.run(scan_cancel).await }));

        let monitor = if config.hotplug {
            let monitor = Arc::new(HotplugMonitor::new(
                deps.uevents,
                source,
                filters,
                waker,
                metrics,
            ));
            let task = monitor.clone();
            let monitor_cancel = cancel.clone();
            handles.push(tokio::spawn(async move { task.run(monitor_cancel).await }));
            Some(monitor)
        } else {
            info!("Hot-plug monitor disabled");
            None
        };

        Ok(Self {
            cancel,
            handles,
            effects,
            monitor,
        })
    }

    /// The hot-plug monitor, when enabled
    pub fn monitor(&self) -> Option<&Arc<HotplugMonitor>> {
        self.monitor.as_ref()
    }

    /// Stop the loops and wait for running effects to write back
    pub async fn shutdown(self) {
        info!("Shutting down node disk agent");
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Agent task ended abnormally: {}", e);
            }
        }
        self.effects.close();
        self.effects.wait().await;
        info!("Node disk agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::RecordingOps;
    use crate::crd::DeviceState;
    use crate::hardware::discovery::scanner::tests::Fixture;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_provisioner() {
        assert_eq!(parse_provisioner("filesystem").unwrap(), ProvisionerSpec::Filesystem);
        assert_eq!(
            parse_provisioner("raw-block:aio").unwrap(),
            ProvisionerSpec::RawBlock {
                disk_driver: "aio".into()
            }
        );
        assert_eq!(
            parse_provisioner("volume-group:vg0").unwrap(),
            ProvisionerSpec::VolumeGroup {
                vg_name: "vg0".into(),
                parameters: None
            }
        );
        assert_matches!(
            parse_provisioner("volume-group"),
            Err(Error::UnknownProvisioner(_))
        );
        assert_matches!(parse_provisioner("zfs"), Err(Error::UnknownProvisioner(_)));
    }

    #[test]
    fn test_config_validation() {
        assert_matches!(AgentConfig::default().validate(), Err(Error::Configuration(_)));
        let config = AgentConfig {
            node_name: "node-1".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_agent_discovers_and_shuts_down() {
        let fx = Fixture::new();
        fx.disk(
            "sdb",
            "8:16",
            false,
            &[("ID_VENDOR", "ATA"), ("ID_SERIAL_SHORT", "S1"), ("ID_WWN", "0x5001")],
        );

        let devices = Arc::new(MemoryStore::<BlockDevice>::new());
        let ops = Arc::new(RecordingOps::default());
        let deps = AgentDeps {
            devices: devices.clone(),
            longhorn_nodes: Arc::new(MemoryStore::new()),
            volume_groups: Arc::new(MemoryStore::new()),
            disk_ops: ops.clone(),
            lvm_ops: ops,
            uevents: Arc::new(|| Err(Error::MonitorSocket("unavailable in tests".into()))),
        };
        let config = AgentConfig {
            node_name: "node-1".into(),
            kernel_root: Some(fx.dir.path().to_path_buf()),
            hotplug: false,
            ..Default::default()
        };

        let agent = Agent::start(config, deps, Arc::new(AgentMetrics::new().unwrap()))
            .await
            .unwrap();
        assert!(agent.monitor().is_none());

        let mut found = false;
        for _ in 0..100 {
            if !devices.all().is_empty() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        agent.shutdown().await;

        assert!(found);
        let records = devices.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state(), DeviceState::Active);
        assert_eq!(records[0].dev_path(), "/dev/sdb");
    }
}
