//! Discovery, caching and partition reconciliation against scripted tool output.

use std::sync::Arc;
use std::time::Duration;

use microgpu_plugin::device::cache::DiscoveryCache;
use microgpu_plugin::device::nvidia::NvidiaManager;
use microgpu_plugin::device::tool::{ScriptedTool, ToolOutput};
use microgpu_plugin::device::DeviceManager;
use microgpu_plugin::partition::reconciler::PartitionPlan;
use microgpu_plugin::partition::samples;
use microgpu_plugin::partition::topology::{GPU_QUERY, PROFILE_QUERY};
use microgpu_plugin::partition::{GpuOutcome, PartitionReport};

const ONE_A100_80GB: &str = "0, GPU-5a0c8e12-7a1b-4c44-9f1e-2b9c0d4e6f10, 81920 MiB, Enabled\n";

fn plan() -> PartitionPlan {
    PartitionPlan {
        enabled: true,
        profile: "3g.40gb".to_string(),
        instance_count: 0,
        skip_configured: false,
        release_delay: Duration::ZERO,
    }
}

/// A single partition-mode A100 80GB with no instances yet.
fn blank_node() -> Arc<ScriptedTool> {
    let tool = Arc::new(ScriptedTool::new());
    tool.respond(GPU_QUERY, ToolOutput::ok(ONE_A100_80GB))
        .respond(PROFILE_QUERY, ToolOutput::ok(samples::A100_80GB_PROFILES))
        .respond(&["--query-gpu=index", "--format=csv,noheader"], ToolOutput::ok("0\n"))
        .respond(
            &["-i", "0", "--query-gpu=mig.mode.current", "--format=csv,noheader"],
            ToolOutput::ok("Enabled\n"),
        )
        .respond(&["mig", "-lgi", "-i", "0"], ToolOutput::failed(samples::NO_GPU_INSTANCES))
        .respond(
            &["-i", "0", "--query-gpu=memory.total", "--format=csv,noheader,nounits"],
            ToolOutput::ok("81920\n"),
        )
        .respond(&["mig", "-i", "0", "-cgi", "9,9", "-C"], ToolOutput::ok("created"));
    tool
}

#[tokio::test]
async fn test_reconcile_then_discover_partitions() {
    let tool = blank_node();
    let manager = NvidiaManager::new(tool.clone(), DiscoveryCache::default(), plan());

    // Partition mode with nothing carved out yet: no schedulable devices.
    assert!(manager.discover_devices().await.unwrap().is_empty());

    let report = manager.partitioner().unwrap().configure_partitions().await;
    assert_eq!(
        report,
        PartitionReport::Completed(vec![GpuOutcome::Configured { gpu: 0, instances: 2 }])
    );

    // The tool now reports the created instances.
    tool.respond(&["mig", "-lgi", "-i", "0"], ToolOutput::ok(samples::GPU_INSTANCES))
        .respond(
            &["mig", "-lci", "-i", "0", "-gi", "1"],
            ToolOutput::ok(samples::COMPUTE_INSTANCES_GI1),
        )
        .respond(
            &["mig", "-lci", "-i", "0", "-gi", "2"],
            ToolOutput::ok(samples::COMPUTE_INSTANCES_GI2),
        );

    let devices = manager.discover_devices().await.unwrap();
    let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["0-GI1-CI0", "0-GI2-CI0"]);
    for d in &devices {
        assert!(d.is_partition);
        assert_eq!(d.physical_id, "0");
        assert_eq!(d.profile.as_deref(), Some("3g.40gb"));
        assert_eq!(d.path(), "/dev/nvidia0");
    }
}

#[tokio::test]
async fn test_second_pass_is_idempotent_with_skip() {
    let tool = blank_node();
    tool.respond(&["mig", "-lgi", "-i", "0"], ToolOutput::ok(samples::GPU_INSTANCES));
    let mut skip = plan();
    skip.skip_configured = true;

    let manager = NvidiaManager::new(tool.clone(), DiscoveryCache::default(), skip);
    let report = manager.partitioner().unwrap().configure_partitions().await;

    assert_eq!(
        report,
        PartitionReport::Completed(vec![GpuOutcome::Untouched { gpu: 0, existing: 2 }])
    );
    assert_eq!(tool.count_calls("mig -i 0"), 0);
}

#[tokio::test]
async fn test_unparseable_profile_fails_each_gpu() {
    let tool = blank_node();
    let mut bad = plan();
    bad.profile = "huge".to_string();

    let manager = NvidiaManager::new(tool, DiscoveryCache::default(), bad);
    let report = manager.partitioner().unwrap().configure_partitions().await;
    let PartitionReport::Completed(outcomes) = report else {
        panic!("expected a completed pass");
    };
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(&outcomes[0], GpuOutcome::Failed { gpu: 0, error } if error.contains("huge")));
}

#[tokio::test(start_paused = true)]
async fn test_cache_window() {
    let tool = Arc::new(ScriptedTool::new());
    tool.respond(GPU_QUERY, ToolOutput::ok("0, GPU-aaaa, 40960 MiB, Disabled\n"));
    let manager = NvidiaManager::new(
        tool.clone(),
        DiscoveryCache::new(Duration::from_secs(300)),
        PartitionPlan::default(),
    );

    let first = manager.discover_devices().await.unwrap();
    tokio::time::advance(Duration::from_secs(299)).await;
    let second = manager.discover_devices().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(tool.count_calls("--query-gpu=index,uuid"), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    manager.discover_devices().await.unwrap();
    assert_eq!(tool.count_calls("--query-gpu=index,uuid"), 2);
}

#[tokio::test]
async fn test_enumeration_failure_is_an_error() {
    let tool = Arc::new(ScriptedTool::new());
    tool.respond(GPU_QUERY, ToolOutput::failed("NVIDIA-SMI has failed because it couldn't communicate with the NVIDIA driver"));
    let manager = NvidiaManager::new(tool, DiscoveryCache::default(), PartitionPlan::default());
    assert!(manager.discover_devices().await.is_err());
}
