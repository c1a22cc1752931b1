//! Topology discovery: turns the tool's inventory into [`Device`]s.
//!
//! GPUs outside partition mode become one whole device each. Partitioned
//! GPUs are walked GPU instance → compute instance, and every compute
//! instance becomes a device with a composite `<gpu>-GI<gi>-CI<ci>` ID.

use tracing::{debug, error, info, warn};

use crate::device::tool::{ToolError, ToolRunner};
use crate::device::{Device, DiscoveryError, Vendor};
use crate::partition::inventory::{
    parse_compute_instances, parse_gpu_instances, parse_gpu_rows, partition_device_id,
    EMPTY_SENTINELS,
};
use crate::partition::profile::ProfileTable;

pub const GPU_QUERY: &[&str] = &[
    "--query-gpu=index,uuid,memory.total,mig.mode.current",
    "--format=csv,noheader",
];

pub const PROFILE_QUERY: &[&str] = &["mig", "-lgip"];

/// Load the profile table; an unavailable listing yields an empty table so
/// every profile resolves to "unknown".
pub async fn load_profile_table(tool: &dyn ToolRunner) -> ProfileTable {
    match tool.run(PROFILE_QUERY).await {
        Ok(out) if out.success => ProfileTable::parse(&out.text),
        Ok(out) => {
            warn!(output = out.trimmed(), "Profile listing failed, names will be unknown");
            ProfileTable::default()
        }
        Err(e) => {
            warn!("Profile listing failed, names will be unknown: {e}");
            ProfileTable::default()
        }
    }
}

/// Enumerate all devices visible through the tool.
pub async fn discover(tool: &dyn ToolRunner) -> Result<Vec<Device>, DiscoveryError> {
    let text = tool.run(GPU_QUERY).await?.into_success(GPU_QUERY)?;
    let rows = parse_gpu_rows(&text);
    if rows.is_empty() && !text.trim().is_empty() {
        return Err(DiscoveryError::Malformed(text.trim().to_string()));
    }

    let mut profiles: Option<ProfileTable> = None;
    let mut devices = Vec::new();

    for row in rows {
        debug!(
            gpu = row.index,
            uuid = %row.uuid,
            memory_mb = ?row.memory_total_mb,
            partitioned = row.partition_mode,
            "Found GPU"
        );
        if !row.partition_mode {
            devices.push(Device::whole(
                Vendor::Nvidia,
                row.uuid.clone(),
                row.index.to_string(),
            ));
            continue;
        }

        if profiles.is_none() {
            profiles = Some(load_profile_table(tool).await);
        }
        let table = profiles.get_or_insert_with(ProfileTable::default);

        match discover_partitions(tool, row.index, table).await {
            Ok(mut partitions) => devices.append(&mut partitions),
            Err(e) => error!(gpu = row.index, "Failed to discover partitions: {e}"),
        }
    }

    info!(devices = devices.len(), "Discovered NVIDIA devices");
    for d in &devices {
        debug!(
            id = %d.id,
            physical = %d.physical_id,
            partition = d.is_partition,
            profile = d.profile.as_deref().unwrap_or("-"),
            "NVIDIA device"
        );
    }

    Ok(devices)
}

/// Enumerate the compute instances of one partitioned GPU.
pub async fn discover_partitions(
    tool: &dyn ToolRunner,
    gpu: u32,
    profiles: &ProfileTable,
) -> Result<Vec<Device>, ToolError> {
    let gpu_arg = gpu.to_string();
    let args = ["mig", "-lgi", "-i", gpu_arg.as_str()];
    let out = tool.run(&args).await?;
    if out.mentions_any(EMPTY_SENTINELS) {
        info!(gpu, "No GPU instances found");
        return Ok(Vec::new());
    }
    let text = out.into_success(&args)?;

    let mut devices = Vec::new();
    for gi in parse_gpu_instances(&text) {
        let gi_arg = gi.instance_id.to_string();
        let ci_args = ["mig", "-lci", "-i", gpu_arg.as_str(), "-gi", gi_arg.as_str()];
        let ci_out = match tool.run(&ci_args).await {
            Ok(out) => out,
            Err(e) => {
                error!(gpu, gi = gi.instance_id, "Failed to query compute instances: {e}");
                continue;
            }
        };
        if ci_out.mentions_any(EMPTY_SENTINELS) {
            debug!(gpu, gi = gi.instance_id, "No compute instances found");
            continue;
        }
        if !ci_out.success {
            error!(
                gpu,
                gi = gi.instance_id,
                output = ci_out.trimmed(),
                "Failed to query compute instances"
            );
            continue;
        }

        let profile = profiles.name_of(gi.profile_id);
        for ci in parse_compute_instances(&ci_out.text) {
            if ci.gpu_instance != gi.instance_id {
                continue;
            }
            devices.push(Device::partition(
                Vendor::Nvidia,
                partition_device_id(gpu, gi.instance_id, ci.instance_id),
                gpu_arg.clone(),
                profile,
            ));
        }
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tool::{ScriptedTool, ToolOutput};
    use crate::partition::samples;

    fn scripted_node() -> ScriptedTool {
        let tool = ScriptedTool::new();
        tool.respond(GPU_QUERY, ToolOutput::ok(samples::GPU_QUERY_MIXED))
            .respond(PROFILE_QUERY, ToolOutput::ok(samples::A100_80GB_PROFILES))
            .respond(&["mig", "-lgi", "-i", "0"], ToolOutput::ok(samples::GPU_INSTANCES))
            .respond(
                &["mig", "-lci", "-i", "0", "-gi", "1"],
                ToolOutput::ok(samples::COMPUTE_INSTANCES_GI1),
            )
            .respond(
                &["mig", "-lci", "-i", "0", "-gi", "2"],
                ToolOutput::ok(samples::COMPUTE_INSTANCES_GI2),
            );
        tool
    }

    #[tokio::test]
    async fn test_discover_mixed_node() {
        let tool = scripted_node();
        let devices = discover(&tool).await.unwrap();

        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["0-GI1-CI0", "0-GI2-CI0", "GPU-8d2f1c34-0e6a-4b7d-a3c2-9e8f7a6b5c41"]
        );

        assert!(devices[0].is_partition);
        assert_eq!(devices[0].physical_id, "0");
        assert_eq!(devices[0].profile.as_deref(), Some("3g.40gb"));

        assert!(!devices[2].is_partition);
        assert_eq!(devices[2].physical_id, "1");
        assert_eq!(devices[2].path(), "/dev/nvidia1");
    }

    #[tokio::test]
    async fn test_unknown_profile_is_not_fatal() {
        let tool = scripted_node();
        tool.respond(PROFILE_QUERY, ToolOutput::failed("error"));

        let devices = discover(&tool).await.unwrap();
        assert_eq!(devices[0].profile.as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn test_no_instances_sentinel_with_nonzero_exit() {
        let tool = scripted_node();
        tool.respond(
            &["mig", "-lgi", "-i", "0"],
            ToolOutput::failed(samples::NO_GPU_INSTANCES),
        );

        let devices = discover(&tool).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].is_partition);
    }

    #[tokio::test]
    async fn test_missing_compute_instances_are_skipped() {
        let tool = scripted_node();
        tool.respond(
            &["mig", "-lci", "-i", "0", "-gi", "1"],
            ToolOutput::failed(samples::NO_COMPUTE_INSTANCES),
        );

        let devices = discover(&tool).await.unwrap();
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["0-GI2-CI0", "GPU-8d2f1c34-0e6a-4b7d-a3c2-9e8f7a6b5c41"]);
    }

    #[tokio::test]
    async fn test_enumeration_failure() {
        let tool = ScriptedTool::new();
        tool.respond(GPU_QUERY, ToolOutput::failed("NVIDIA-SMI has failed"));
        let err = discover(&tool).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Enumeration(_)));
    }
}
