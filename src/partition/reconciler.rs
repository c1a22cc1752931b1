//! Idempotent partition (re)configuration.
//!
//! One pass walks every GPU: enable partition mode, optionally leave
//! already-partitioned GPUs alone, tear down existing compute and GPU
//! instances, then create as many instances of the target profile as fit
//! in memory (capped by the requested count). A failure on one GPU is
//! logged and recorded in the report; the pass always continues.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::device::tool::{ToolOutput, ToolRunner};
use crate::partition::inventory::{
    leading_number, parse_gpu_indexes, parse_gpu_instances, EMPTY_SENTINELS,
    UNSUPPORTED_SENTINELS,
};
use crate::partition::profile::{effective_count, max_instances, profile_memory_mb, ProfileTable};
use crate::partition::topology::PROFILE_QUERY;
use crate::partition::{GpuOutcome, PartitionError, PartitionReport};

/// Desired partition layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionPlan {
    /// Whether partition management runs at all.
    pub enabled: bool,

    /// Target profile name, e.g. "3g.20gb".
    pub profile: String,

    /// Instances per GPU (0 = as many as fit).
    pub instance_count: u32,

    /// Leave GPUs that already have partitions untouched.
    pub skip_configured: bool,

    /// Pause after teardown for the driver to release resources.
    #[serde(with = "crate::config::duration_secs")]
    pub release_delay: Duration,
}

impl Default for PartitionPlan {
    fn default() -> Self {
        Self {
            enabled: false,
            profile: "3g.20gb".to_string(),
            instance_count: 0,
            skip_configured: false,
            release_delay: Duration::from_secs(2),
        }
    }
}

pub struct Reconciler {
    tool: Arc<dyn ToolRunner>,
    plan: PartitionPlan,
}

impl Reconciler {
    pub fn new(tool: Arc<dyn ToolRunner>, plan: PartitionPlan) -> Self {
        Self { tool, plan }
    }

    /// Run one reconciliation pass over every GPU.
    pub async fn reconcile(&self) -> PartitionReport {
        if !self.plan.enabled {
            info!("Partition management is disabled");
            return PartitionReport::Disabled;
        }

        info!(profile = %self.plan.profile, "Starting partition configuration");

        let probe = match self.tool.run(PROFILE_QUERY).await {
            Ok(out) => out,
            Err(e) => {
                error!("Failed to probe partition support: {e}");
                return PartitionReport::ProbeFailed(e.to_string());
            }
        };
        if !self.supports_partitions(&probe) {
            warn!("Partitioning is not supported on this node, skipping configuration");
            return PartitionReport::Unsupported;
        }
        if !probe.success {
            error!(output = probe.trimmed(), "Partition support probe failed");
            return PartitionReport::ProbeFailed(probe.trimmed().to_string());
        }
        let profiles = ProfileTable::parse(&probe.text);

        let gpus = match self.list_gpus().await {
            Ok(gpus) => gpus,
            Err(e) => {
                error!("Failed to list GPUs: {e}");
                return PartitionReport::ProbeFailed(e.to_string());
            }
        };

        let mut outcomes = Vec::with_capacity(gpus.len());
        for gpu in gpus {
            let outcome = match self.reconcile_gpu(gpu, &profiles).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(gpu, "Partition configuration failed: {e}");
                    GpuOutcome::Failed {
                        gpu,
                        error: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        PartitionReport::Completed(outcomes)
    }

    fn supports_partitions(&self, probe: &ToolOutput) -> bool {
        if probe.mentions_any(UNSUPPORTED_SENTINELS) {
            return false;
        }
        !probe.trimmed().is_empty()
    }

    async fn list_gpus(&self) -> Result<Vec<u32>, PartitionError> {
        let args = ["--query-gpu=index", "--format=csv,noheader"];
        let text = self.tool.run(&args).await?.into_success(&args)?;
        Ok(parse_gpu_indexes(&text))
    }

    async fn reconcile_gpu(
        &self,
        gpu: u32,
        profiles: &ProfileTable,
    ) -> Result<GpuOutcome, PartitionError> {
        self.ensure_partition_mode(gpu).await?;

        let existing = self.count_gpu_instances(gpu).await?;
        if existing > 0 && self.plan.skip_configured {
            info!(gpu, existing, "Skipping already partitioned GPU");
            return Ok(GpuOutcome::Untouched { gpu, existing });
        }

        // Resolve the target before destroying anything it would replace.
        let profile_mb = profile_memory_mb(&self.plan.profile)
            .ok_or_else(|| PartitionError::UnparseableProfile(self.plan.profile.clone()))?;
        let profile = profiles
            .find_by_name(&self.plan.profile)
            .ok_or_else(|| PartitionError::UnknownProfile(self.plan.profile.clone()))?;

        if existing > 0 {
            self.teardown(gpu).await;
        }

        let total_mb = self.total_memory_mb(gpu).await?;

        let max = max_instances(total_mb, profile_mb);
        if max == 0 {
            warn!(
                gpu,
                total_mb,
                required_mb = profile_mb,
                profile = %self.plan.profile,
                "Insufficient memory for profile"
            );
            return Ok(GpuOutcome::Skipped {
                gpu,
                reason: format!(
                    "{total_mb} MB is less than the {profile_mb} MB required by {}",
                    self.plan.profile
                ),
            });
        }
        if self.plan.instance_count > 0 && u64::from(self.plan.instance_count) > max {
            warn!(
                gpu,
                requested = self.plan.instance_count,
                max,
                "Requested instance count exceeds what fits, capping"
            );
        }
        let count = effective_count(self.plan.instance_count, max);

        info!(gpu, count, profile = %profile.name, id = profile.numeric_id, "Creating partitions");

        let index = gpu.to_string();
        let spec = vec![profile.numeric_id.to_string(); count as usize].join(",");
        let args = ["mig", "-i", index.as_str(), "-cgi", spec.as_str(), "-C"];
        self.tool
            .run(&args)
            .await?
            .into_success(&args)
            .map_err(|e| PartitionError::Create { gpu, source: e })?;

        info!(gpu, count, "Partitions created");
        Ok(GpuOutcome::Configured {
            gpu,
            instances: count,
        })
    }

    async fn ensure_partition_mode(&self, gpu: u32) -> Result<(), PartitionError> {
        let index = gpu.to_string();
        let args = ["-i", index.as_str(), "--query-gpu=mig.mode.current", "--format=csv,noheader"];
        let mode = self.tool.run(&args).await?.into_success(&args)?;
        if mode.trim() == "Enabled" {
            info!(gpu, "GPU already in partition mode");
            return Ok(());
        }

        let args = ["-i", index.as_str(), "-mig", "1"];
        self.tool
            .run(&args)
            .await?
            .into_success(&args)
            .map_err(|e| PartitionError::EnableMode { gpu, source: e })?;
        info!(gpu, "Enabled partition mode");
        Ok(())
    }

    async fn count_gpu_instances(&self, gpu: u32) -> Result<usize, PartitionError> {
        let index = gpu.to_string();
        let args = ["mig", "-lgi", "-i", index.as_str()];
        let out = self.tool.run(&args).await?;
        if out.mentions_any(EMPTY_SENTINELS) {
            return Ok(0);
        }
        let text = out.into_success(&args)?;
        Ok(parse_gpu_instances(&text).len())
    }

    /// Compute instances live inside GPU instances, so they go first.
    async fn teardown(&self, gpu: u32) {
        info!(gpu, "Destroying existing partitions");

        let index = gpu.to_string();
        for (flag, what) in [("-dci", "compute instances"), ("-dgi", "GPU instances")] {
            let args = ["mig", "-i", index.as_str(), flag];
            match self.tool.run(&args).await {
                Ok(out) if out.success || out.mentions_any(EMPTY_SENTINELS) => {}
                Ok(out) => error!(gpu, output = out.trimmed(), "Failed to destroy {what}"),
                Err(e) => error!(gpu, "Failed to destroy {what}: {e}"),
            }
        }

        if !self.plan.release_delay.is_zero() {
            tokio::time::sleep(self.plan.release_delay).await;
        }
    }

    async fn total_memory_mb(&self, gpu: u32) -> Result<u64, PartitionError> {
        let index = gpu.to_string();
        let args = [
            "-i",
            index.as_str(),
            "--query-gpu=memory.total",
            "--format=csv,noheader,nounits",
        ];
        let text = self.tool.run(&args).await?.into_success(&args)?;
        leading_number(&text).ok_or_else(|| PartitionError::MemoryQuery {
            gpu,
            output: text.trim().to_string(),
        })
    }
}
