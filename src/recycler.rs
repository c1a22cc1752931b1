//! Periodic release of allocations whose owner is gone.
//!
//! Each pass snapshots the allocator, asks the workload directory about
//! every owner, and releases everything unowned or inactive in one batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::allocator::DeviceAllocator;
use crate::metrics::PluginMetrics;
use crate::workload::WorkloadDirectory;

/// Default period between recycling passes.
pub const DEFAULT_RECYCLE_INTERVAL: Duration = Duration::from_secs(30);

pub struct ResourceRecycler {
    allocator: Arc<DeviceAllocator>,
    directory: Arc<dyn WorkloadDirectory>,
    metrics: Option<PluginMetrics>,
}

impl ResourceRecycler {
    pub fn new(allocator: Arc<DeviceAllocator>, directory: Arc<dyn WorkloadDirectory>) -> Self {
        Self {
            allocator,
            directory,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PluginMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One recycling pass. Returns the released device IDs.
    pub async fn run_once(&self) -> Vec<String> {
        let snapshot = self.allocator.snapshot();
        let mut stale = Vec::new();

        // The allocator lock is not held here; liveness lookups may be slow.
        for (device_id, owner) in snapshot {
            if owner.is_empty() {
                debug!(device = %device_id, "Releasing device with no owner");
                stale.push(device_id);
            } else if !self.directory.is_active(&owner).await {
                debug!(device = %device_id, owner = %owner, "Releasing device of inactive workload");
                stale.push(device_id);
            }
        }

        if stale.is_empty() {
            return stale;
        }

        let released = self.allocator.deallocate(&stale);
        if let Some(metrics) = &self.metrics {
            metrics.recycled(released.len());
            metrics.set_allocated(self.allocator.len());
        }
        info!(released = released.len(), "Recycled stale allocations");
        released
    }

    /// Run passes every `interval` until `shutdown` is cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Resource recycler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }
}
