//! Node Disk Agent
//!
//! Discovers the block devices of one node, records them with stable
//! identities and provisions them into Longhorn or LVM.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  node-disk-agent (one per node)                              │
//! │                                                              │
//! │   uevents ──► Hot-plug Monitor ──┐                           │
//! │                                  ▼                           │
//! │   sysfs/udev ──► Scanner loop ◄── record change feed         │
//! │                      │                                       │
//! │                      ▼                                       │
//! │               Effect Executor ──► Longhorn / LVM             │
//! │                                                              │
//! │   :8081 /healthz /readyz        :8080 /metrics               │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_disk_agent::{
    crd::{BlockDevice, LonghornNode, LvmVolumeGroup, LABEL_NODE},
    domain::ports::{LabelSelector, RecordStore},
    parse_provisioner, Agent, AgentConfig, AgentDeps, AgentMetrics, Error, KubeStore, MemoryStore,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node Disk Agent - block device discovery and provisioning
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Namespace of the agent's records
    #[arg(long, env = "NAMESPACE", default_value = "node-disk-agent")]
    namespace: String,

    /// Namespace of Longhorn's node records
    #[arg(long, env = "LONGHORN_NAMESPACE", default_value = "longhorn-system")]
    longhorn_namespace: String,

    /// Full rescan interval in seconds
    #[arg(long, env = "SCAN_INTERVAL", default_value = "30")]
    scan_interval_secs: u64,

    /// Delay in seconds before a not-ready step is retried
    #[arg(long, env = "REQUEUE_DELAY", default_value = "5")]
    requeue_delay_secs: u64,

    /// Maximum concurrent filesystem formats
    #[arg(long, env = "MAX_CONCURRENT_FORMATS", default_value = "5")]
    format_concurrency: usize,

    /// Mount root for auto-provisioned disks
    #[arg(long, env = "AUTO_PROVISION_MOUNT_ROOT", default_value = "/var/lib/node-disk-agent/disks")]
    mount_root: String,

    /// Prefix under which the host's /sys, /run/udev, /proc and /dev are mounted
    #[arg(long, env = "HOST_ROOT")]
    host_root: Option<PathBuf>,

    /// Filter configuration file (YAML)
    #[arg(long, env = "FILTER_CONFIG")]
    filter_config: Option<PathBuf>,

    /// Device globs excluded on every node
    #[arg(long, env = "EXCLUDE_DEVICES", value_delimiter = ',')]
    exclude_devices: Vec<String>,

    /// Vendors excluded on every node
    #[arg(long, env = "EXCLUDE_VENDORS", value_delimiter = ',')]
    exclude_vendors: Vec<String>,

    /// Device globs auto-provisioned on every node
    #[arg(long, env = "AUTO_PROVISION_DEVICES", value_delimiter = ',')]
    auto_provision: Vec<String>,

    /// Backend for auto-provisioned disks (filesystem, raw-block[:driver], volume-group:<vg>)
    #[arg(long, env = "DEFAULT_PROVISIONER", default_value = "filesystem")]
    default_provisioner: String,

    /// Disable the hot-plug monitor
    #[arg(long, env = "DISABLE_HOTPLUG")]
    disable_hotplug: bool,

    /// Run disk tools in the host mount namespace
    #[arg(long, env = "HOST_NAMESPACE")]
    host_namespace: bool,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes, records kept in memory)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

impl Args {
    fn agent_config(&self) -> Result<AgentConfig> {
        let mut config = AgentConfig {
            node_name: self.node_name.clone(),
            namespace: self.namespace.clone(),
            longhorn_namespace: self.longhorn_namespace.clone(),
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            requeue_delay: Duration::from_secs(self.requeue_delay_secs),
            format_concurrency: self.format_concurrency,
            mount_root: self.mount_root.clone(),
            kernel_root: self.host_root.clone(),
            filter_config: self.filter_config.clone(),
            hotplug: !self.disable_hotplug,
            default_provisioner: parse_provisioner(&self.default_provisioner)?,
            host_namespace: self.host_namespace,
            ..Default::default()
        };
        let filters = &mut config.default_filters;
        filters.exclude_devices.extend(self.exclude_devices.iter().cloned());
        filters.exclude_vendors.extend(self.exclude_vendors.iter().cloned());
        filters
            .auto_provision_devices
            .extend(self.auto_provision.iter().cloned());
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = args
        .agent_config()
        .context("invalid agent configuration")?;

    info!("Starting Node Disk Agent");
    info!("  Version: {}", node_disk_agent::VERSION);
    info!("  Node: {}", config.node_name);
    info!("  Scan interval: {:?}", config.scan_interval);
    info!("  Hot-plug monitor: {}", config.hotplug);
    info!("  Standalone mode: {}", args.standalone);

    let metrics = Arc::new(AgentMetrics::new().context("failed to register metrics")?);
    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let served = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, served).await {
            error!("Metrics server error: {}", e);
        }
    });

    let deps = if args.standalone {
        AgentDeps::host(
            Arc::new(MemoryStore::<BlockDevice>::new()),
            Arc::new(MemoryStore::<LonghornNode>::new()),
            Arc::new(MemoryStore::<LvmVolumeGroup>::new()),
            config.host_namespace,
        )
    } else {
        let client = kube::Client::try_default()
            .await
            .context("failed to create Kubernetes client")?;
        let mut own = LabelSelector::new();
        own.insert(LABEL_NODE.to_string(), config.node_name.clone());
        let devices: Arc<dyn RecordStore<BlockDevice>> =
            Arc::new(KubeStore::new(client.clone(), &config.namespace).watching(own.clone()));
        let nodes: Arc<dyn RecordStore<LonghornNode>> =
            Arc::new(KubeStore::spec_only(client.clone(), &config.longhorn_namespace));
        let groups: Arc<dyn RecordStore<LvmVolumeGroup>> =
            Arc::new(KubeStore::new(client, &config.namespace).watching(own));
        AgentDeps::host(devices, nodes, groups, config.host_namespace)
    };

    let agent = Agent::start(config, deps, metrics)
        .await
        .context("failed to start agent")?;
    ready.store(true, Ordering::SeqCst);
    info!("Agent started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    ready.store(false, Ordering::SeqCst);

    agent.shutdown().await;

    info!("Agent shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if ready => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<AgentMetrics>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(buffer) => {
                                let mut response = Response::new(Body::from(buffer));
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    HeaderValue::from_static("text/plain; version=0.0.4"),
                                );
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                let mut response = Response::new(Body::from(e.to_string()));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        },
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
