//! NVIDIA device manager backed by nvidia-smi.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::device::cache::DiscoveryCache;
use crate::device::tool::ToolRunner;
use crate::device::{Device, DeviceManager, DiscoveryError, Vendor};
use crate::partition::reconciler::{PartitionPlan, Reconciler};
use crate::partition::{topology, PartitionConfigurator, PartitionReport};

pub struct NvidiaManager {
    tool: Arc<dyn ToolRunner>,
    cache: DiscoveryCache,
    reconciler: Reconciler,
}

impl NvidiaManager {
    pub fn new(tool: Arc<dyn ToolRunner>, cache: DiscoveryCache, plan: PartitionPlan) -> Self {
        Self {
            reconciler: Reconciler::new(tool.clone(), plan),
            tool,
            cache,
        }
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }
}

/// True if a successful utilization query answered with anything at all.
///
/// GPUs in partition mode answer "[N/A]", which still means the driver
/// reached the device.
fn answered(text: &str) -> bool {
    !text.trim().is_empty()
}

#[async_trait]
impl DeviceManager for NvidiaManager {
    fn vendor(&self) -> Vendor {
        Vendor::Nvidia
    }

    async fn discover_devices(&self) -> Result<Vec<Device>, DiscoveryError> {
        let tool = self.tool.clone();
        self.cache
            .get_or_refresh(|| async move {
                info!("Discovering NVIDIA devices");
                topology::discover(tool.as_ref()).await
            })
            .await
    }

    async fn check_health(&self, device_id: &str) -> bool {
        let Some(device) = self.cache.lookup(device_id) else {
            warn!(device = device_id, "Device not found in last discovery");
            return false;
        };

        // Partitions share the health of their physical GPU.
        let target = device.physical_id.as_str();
        let args = ["-i", target, "--query-gpu=utilization.gpu", "--format=csv,noheader"];
        match self.tool.run(&args).await {
            Ok(out) if out.success && answered(&out.text) => {
                debug!(device = device_id, gpu = target, utilization = out.trimmed(), "Device healthy");
                true
            }
            Ok(out) => {
                warn!(device = device_id, gpu = target, output = out.trimmed(), "Health query returned no usable value");
                false
            }
            Err(e) => {
                error!(device = device_id, gpu = target, "Failed to check health: {e}");
                false
            }
        }
    }

    fn partitioner(&self) -> Option<&dyn PartitionConfigurator> {
        Some(self)
    }
}

#[async_trait]
impl PartitionConfigurator for NvidiaManager {
    async fn configure_partitions(&self) -> PartitionReport {
        let report = self.reconciler.reconcile().await;
        if let PartitionReport::Completed(_) = report {
            self.cache.invalidate();
        }
        info!(configured = report.configured_gpus(), "Partition configuration finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::tool::{ScriptedTool, ToolOutput};
    use crate::partition::samples;
    use crate::partition::topology::GPU_QUERY;

    fn manager(tool: Arc<ScriptedTool>) -> NvidiaManager {
        NvidiaManager::new(
            tool,
            DiscoveryCache::new(Duration::from_secs(300)),
            PartitionPlan::default(),
        )
    }

    fn whole_gpu_node() -> Arc<ScriptedTool> {
        let tool = Arc::new(ScriptedTool::new());
        tool.respond(
            GPU_QUERY,
            ToolOutput::ok("0, GPU-aaaa, 40960 MiB, Disabled\n1, GPU-bbbb, 40960 MiB, [N/A]\n"),
        );
        tool
    }

    #[test]
    fn test_answered() {
        assert!(answered("37 %\n"));
        assert!(answered("0"));
        assert!(answered("[N/A]"));
        assert!(!answered(""));
        assert!(!answered(" \n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_cached_within_ttl() {
        let tool = whole_gpu_node();
        let mgr = manager(tool.clone());

        let first = mgr.discover_devices().await.unwrap();
        let second = mgr.discover_devices().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(tool.count_calls("--query-gpu=index,uuid"), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        mgr.discover_devices().await.unwrap();
        assert_eq!(tool.count_calls("--query-gpu=index,uuid"), 2);
    }

    #[tokio::test]
    async fn test_health_of_partition_checks_physical_gpu() {
        let tool = Arc::new(ScriptedTool::new());
        tool.respond(GPU_QUERY, ToolOutput::ok(samples::GPU_QUERY_MIXED))
            .respond(topology::PROFILE_QUERY, ToolOutput::ok(samples::A100_80GB_PROFILES))
            .respond(&["mig", "-lgi", "-i", "0"], ToolOutput::ok(samples::GPU_INSTANCES))
            .respond(
                &["mig", "-lci", "-i", "0", "-gi", "1"],
                ToolOutput::ok(samples::COMPUTE_INSTANCES_GI1),
            )
            .respond(
                &["mig", "-lci", "-i", "0", "-gi", "2"],
                ToolOutput::ok(samples::COMPUTE_INSTANCES_GI2),
            )
            .respond(
                &["-i", "0", "--query-gpu=utilization.gpu", "--format=csv,noheader"],
                ToolOutput::ok("12 %\n"),
            );
        let mgr = manager(tool.clone());
        mgr.discover_devices().await.unwrap();

        assert!(mgr.check_health("0-GI1-CI0").await);
        // GPU 1 has no scripted utilization: fail closed.
        assert!(!mgr.check_health("GPU-8d2f1c34-0e6a-4b7d-a3c2-9e8f7a6b5c41").await);
        // Unknown IDs are unhealthy.
        assert!(!mgr.check_health("0-GI9-CI0").await);
    }

    #[tokio::test]
    async fn test_partitions_healthy_when_utilization_unavailable() {
        let tool = Arc::new(ScriptedTool::new());
        tool.respond(GPU_QUERY, ToolOutput::ok(samples::GPU_QUERY_MIXED))
            .respond(topology::PROFILE_QUERY, ToolOutput::ok(samples::A100_80GB_PROFILES))
            .respond(&["mig", "-lgi", "-i", "0"], ToolOutput::ok(samples::GPU_INSTANCES))
            .respond(
                &["mig", "-lci", "-i", "0", "-gi", "1"],
                ToolOutput::ok(samples::COMPUTE_INSTANCES_GI1),
            )
            .respond(
                &["mig", "-lci", "-i", "0", "-gi", "2"],
                ToolOutput::ok(samples::COMPUTE_INSTANCES_GI2),
            )
            .respond(
                &["-i", "0", "--query-gpu=utilization.gpu", "--format=csv,noheader"],
                ToolOutput::ok("[N/A]\n"),
            );
        let mgr = manager(tool);
        mgr.discover_devices().await.unwrap();

        assert!(mgr.check_health("0-GI1-CI0").await);
        assert!(mgr.check_health("0-GI2-CI0").await);
    }

    #[tokio::test]
    async fn test_failed_health_query_is_unhealthy() {
        let tool = whole_gpu_node();
        tool.respond(
            &["-i", "0", "--query-gpu=utilization.gpu", "--format=csv,noheader"],
            ToolOutput::failed("Unable to determine the device handle for GPU 0000:17:00.0: Unknown Error"),
        );
        let mgr = manager(tool);
        mgr.discover_devices().await.unwrap();
        assert!(!mgr.check_health("GPU-aaaa").await);
    }

    #[tokio::test]
    async fn test_health_empty_output_is_unhealthy() {
        let tool = whole_gpu_node();
        tool.respond(
            &["-i", "0", "--query-gpu=utilization.gpu", "--format=csv,noheader"],
            ToolOutput::ok("\n"),
        );
        let mgr = manager(tool);
        mgr.discover_devices().await.unwrap();
        assert!(!mgr.check_health("GPU-aaaa").await);
    }

    #[tokio::test]
    async fn test_partitioner_present() {
        let mgr = manager(whole_gpu_node());
        assert!(mgr.partitioner().is_some());
        // Disabled plan: nothing is touched and the cache survives.
        mgr.discover_devices().await.unwrap();
        let report = mgr.partitioner().unwrap().configure_partitions().await;
        assert_eq!(report, PartitionReport::Disabled);
        assert!(mgr.cache().fresh().is_some());
    }
}
