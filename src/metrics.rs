//! Prometheus metrics for the plugins.
//!
//! One registry per process; every series carries a `vendor` label and each
//! plugin holds a [`PluginMetrics`] bound to its vendor.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::device::Vendor;

pub struct Metrics {
    registry: Registry,
    discovered: IntGaugeVec,
    healthy: IntGaugeVec,
    allocated: IntGaugeVec,
    allocations: IntCounterVec,
    conflicts: IntCounterVec,
    recycled: IntCounterVec,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGaugeVec, prometheus::Error> {
    let vec = IntGaugeVec::new(Opts::new(name, help).namespace("microgpu"), &["vendor"])?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
    let vec = IntCounterVec::new(Opts::new(name, help).namespace("microgpu"), &["vendor"])?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        Ok(Self {
            discovered: gauge(&registry, "devices_discovered", "Devices in the last discovery")?,
            healthy: gauge(&registry, "devices_healthy", "Devices reported healthy on the last push")?,
            allocated: gauge(&registry, "devices_allocated", "Devices currently allocated")?,
            allocations: counter(&registry, "allocations_total", "Successful container allocations")?,
            conflicts: counter(&registry, "allocation_conflicts_total", "Allocations refused because a device was taken")?,
            recycled: counter(&registry, "devices_recycled_total", "Devices released by the recycler")?,
            registry,
        })
    }

    pub fn for_vendor(&self, vendor: Vendor) -> PluginMetrics {
        let label = [vendor.as_str()];
        PluginMetrics {
            discovered: self.discovered.with_label_values(&label),
            healthy: self.healthy.with_label_values(&label),
            allocated: self.allocated.with_label_values(&label),
            allocations: self.allocations.with_label_values(&label),
            conflicts: self.conflicts.with_label_values(&label),
            recycled: self.recycled.with_label_values(&label),
        }
    }

    /// Text exposition of every registered series.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Metric handles for a single vendor plugin.
#[derive(Clone)]
pub struct PluginMetrics {
    discovered: IntGauge,
    healthy: IntGauge,
    allocated: IntGauge,
    allocations: IntCounter,
    conflicts: IntCounter,
    recycled: IntCounter,
}

impl PluginMetrics {
    pub fn observe_push(&self, discovered: usize, healthy: usize) {
        self.discovered.set(discovered as i64);
        self.healthy.set(healthy as i64);
    }

    pub fn set_allocated(&self, allocated: usize) {
        self.allocated.set(allocated as i64);
    }

    pub fn allocation(&self) {
        self.allocations.inc();
    }

    pub fn conflict(&self) {
        self.conflicts.inc();
    }

    pub fn recycled(&self, count: usize) {
        self.recycled.inc_by(count as u64);
    }
}
