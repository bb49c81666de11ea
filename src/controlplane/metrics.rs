//! Agent Metrics
//!
//! Prometheus counters and gauges for discovery, effects and the hot-plug
//! monitor, kept in a registry owned by the agent.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics exported by one agent
#[derive(Debug, Clone)]
pub struct AgentMetrics {
    registry: Registry,
    /// Records currently Active on this node
    pub devices_active: IntGauge,
    /// Devices skipped during a scan (no identity, duplicate WWN, excluded)
    pub devices_skipped: IntCounterVec,
    /// Completed scan passes
    pub scans: IntCounter,
    /// Effects started, by effect
    pub effects_dispatched: IntCounterVec,
    /// Effects that set the Failed phase, by effect
    pub effects_failed: IntCounterVec,
    /// Hot-plug monitor respawns
    pub monitor_restarts: IntCounter,
}

impl AgentMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("node_disk_agent".to_string()), None)
            .map_err(metrics_error)?;

        let devices_active = IntGauge::new("devices_active", "Block device records marked Active")
            .map_err(metrics_error)?;
        let devices_skipped = IntCounterVec::new(
            Opts::new("devices_skipped_total", "Devices skipped during a scan"),
            &["reason"],
        )
        .map_err(metrics_error)?;
        let scans = IntCounter::new("scans_total", "Completed scan passes").map_err(metrics_error)?;
        let effects_dispatched = IntCounterVec::new(
            Opts::new("effects_dispatched_total", "Provisioning effects started"),
            &["effect"],
        )
        .map_err(metrics_error)?;
        let effects_failed = IntCounterVec::new(
            Opts::new("effects_failed_total", "Provisioning effects that failed"),
            &["effect"],
        )
        .map_err(metrics_error)?;
        let monitor_restarts = IntCounter::new("monitor_restarts_total", "Hot-plug monitor respawns")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(devices_active.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(devices_skipped.clone()))
            .map_err(metrics_error)?;
        registry.register(Box::new(scans.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(effects_dispatched.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(effects_failed.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(monitor_restarts.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            devices_active,
            devices_skipped,
            scans,
            effects_dispatched,
            effects_failed,
            monitor_restarts,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok(buffer)
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_prefixed_metrics() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.scans.inc();
        metrics.effects_failed.with_label_values(&["format"]).inc();
        metrics.monitor_restarts.inc();

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("node_disk_agent_scans_total 1"));
        assert!(text.contains("node_disk_agent_effects_failed_total{effect=\"format\"} 1"));
        assert!(text.contains("node_disk_agent_monitor_restarts_total 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = AgentMetrics::new().unwrap();
        let b = AgentMetrics::new().unwrap();
        a.scans.inc();
        assert_eq!(b.scans.get(), 0);
    }
}
