//! Parsers for the tool's inventory listings.
//!
//! All parsers are lenient: rows that do not match are skipped, never
//! reported as errors, since the tool's table layout shifts between
//! driver releases.

use std::sync::LazyLock;

use regex::Regex;

/// Phrases meaning "nothing to list" rather than a failure.
pub const EMPTY_SENTINELS: &[&str] = &[
    "No GPU instances found",
    "No compute instances found",
    "Not Found",
    "No devices were found",
];

/// Phrases meaning the hardware cannot be partitioned.
pub const UNSUPPORTED_SENTINELS: &[&str] = &["No MIG-supported devices found", "not supported"];

/// One row of the per-GPU query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuRow {
    pub index: u32,
    pub uuid: String,
    pub memory_total_mb: Option<u64>,
    pub partition_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuInstance {
    pub gpu: u32,
    pub profile_id: u32,
    pub instance_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeInstance {
    pub gpu: u32,
    pub gpu_instance: u32,
    pub instance_id: u32,
}

static GI_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|\s*(\d+)\s+MIG\s+\S+\s+(\d+)\s+(\d+)\s+\d+:\d+")
        .expect("valid GPU instance row pattern")
});

static CI_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|\s*(\d+)\s+(\d+)\s+MIG\s+\S+\s+\d+\s+(\d+)\s+\d+:\d+")
        .expect("valid compute instance row pattern")
});

/// Leading integer of a value such as "81920 MiB".
pub fn leading_number(value: &str) -> Option<u64> {
    let value = value.trim();
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value[..end].parse().ok()
}

/// Parse `--query-gpu=index,uuid,memory.total,mig.mode.current --format=csv,noheader`.
pub fn parse_gpu_rows(text: &str) -> Vec<GpuRow> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 4 {
                return None;
            }
            let index = fields[0].parse().ok()?;
            Some(GpuRow {
                index,
                uuid: fields[1].to_string(),
                memory_total_mb: leading_number(fields[2]),
                partition_mode: fields[3] == "Enabled",
            })
        })
        .collect()
}

/// Parse `--query-gpu=index --format=csv,noheader`.
pub fn parse_gpu_indexes(text: &str) -> Vec<u32> {
    text.lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Parse `mig -lgi -i <gpu>`.
pub fn parse_gpu_instances(text: &str) -> Vec<GpuInstance> {
    text.lines()
        .filter_map(|line| {
            let caps = GI_ROW.captures(line.trim_start())?;
            Some(GpuInstance {
                gpu: caps[1].parse().ok()?,
                profile_id: caps[2].parse().ok()?,
                instance_id: caps[3].parse().ok()?,
            })
        })
        .collect()
}

/// Parse `mig -lci -i <gpu> -gi <gi>`.
pub fn parse_compute_instances(text: &str) -> Vec<ComputeInstance> {
    text.lines()
        .filter_map(|line| {
            let caps = CI_ROW.captures(line.trim_start())?;
            Some(ComputeInstance {
                gpu: caps[1].parse().ok()?,
                gpu_instance: caps[2].parse().ok()?,
                instance_id: caps[3].parse().ok()?,
            })
        })
        .collect()
}

/// Composite ID for a compute instance.
pub fn partition_device_id(gpu: u32, gpu_instance: u32, compute_instance: u32) -> String {
    format!("{gpu}-GI{gpu_instance}-CI{compute_instance}")
}
