//! Partition topology engine.
//!
//! - [`inventory`]: lenient parsers for the tool's tables
//! - [`profile`]: profile names, IDs and memory arithmetic
//! - [`topology`]: discovery of whole GPUs and their partitions
//! - [`reconciler`]: idempotent partition (re)configuration
//! - [`samples`]: captured tool output

pub mod inventory;
pub mod profile;
pub mod reconciler;
pub mod samples;
pub mod topology;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::device::tool::ToolError;

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("cannot derive a memory size from profile {0}")]
    UnparseableProfile(String),

    #[error("profile {0} is not offered by this GPU")]
    UnknownProfile(String),

    #[error("GPU {gpu} reported an unreadable memory size: {output}")]
    MemoryQuery { gpu: u32, output: String },

    #[error("failed to enable partition mode on GPU {gpu}: {source}")]
    EnableMode {
        gpu: u32,
        #[source]
        source: ToolError,
    },

    #[error("failed to create partitions on GPU {gpu}: {source}")]
    Create {
        gpu: u32,
        #[source]
        source: ToolError,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// What one reconciliation pass did to a GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GpuOutcome {
    Configured { gpu: u32, instances: u64 },
    Untouched { gpu: u32, existing: usize },
    Skipped { gpu: u32, reason: String },
    Failed { gpu: u32, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PartitionReport {
    Disabled,
    Unsupported,
    ProbeFailed(String),
    Completed(Vec<GpuOutcome>),
}

impl PartitionReport {
    pub fn configured_gpus(&self) -> usize {
        match self {
            PartitionReport::Completed(outcomes) => outcomes
                .iter()
                .filter(|o| matches!(o, GpuOutcome::Configured { .. }))
                .count(),
            _ => 0,
        }
    }
}

/// Capability exposed by device managers that can partition their GPUs.
#[async_trait]
pub trait PartitionConfigurator: Send + Sync {
    async fn configure_partitions(&self) -> PartitionReport;
}
