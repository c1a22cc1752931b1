//! Device catalog: per-vendor discovery and health polling.
//!
//! - [`cache`]: TTL-bounded discovery cache shared by the vendor managers
//! - [`tool`]: runner abstraction over the vendor management tool
//! - [`nvidia`]: nvidia-smi backed manager with partition support
//! - [`huawei`]: static NPU inventory
//! - [`simulator`]: synthetic devices for local testing

pub mod cache;
pub mod huawei;
pub mod nvidia;
pub mod simulator;
pub mod tool;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::partition::PartitionConfigurator;
use tool::ToolError;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("device enumeration failed: {0}")]
    Enumeration(#[from] ToolError),

    #[error("device enumeration returned unusable output: {0}")]
    Malformed(String),
}

/// Closed set of supported accelerator vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Nvidia,
    Huawei,
    Simulator,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Nvidia => "nvidia",
            Vendor::Huawei => "huawei",
            Vendor::Simulator => "simulator",
        }
    }

    /// Extended resource name advertised to the scheduler.
    pub fn resource_name(&self) -> String {
        format!("{}.com/microgpu", self.as_str())
    }

    /// Socket basename under the device-plugin directory.
    pub fn socket_name(&self) -> String {
        format!("microui.sock.{}", self.as_str())
    }

    /// Device node backing a whole physical device.
    pub fn device_node(&self, physical_id: &str) -> String {
        match self {
            Vendor::Nvidia => format!("/dev/nvidia{physical_id}"),
            Vendor::Huawei => format!("/dev/davinci{physical_id}"),
            Vendor::Simulator => format!("/dev/sim_gpu{physical_id}"),
        }
    }

    /// Environment variable the container runtime reads to expose devices.
    pub fn visibility_env(&self) -> &'static str {
        match self {
            Vendor::Nvidia => "NVIDIA_VISIBLE_DEVICES",
            Vendor::Huawei => "ASCEND_VISIBLE_DEVICES",
            Vendor::Simulator => "SIM_VISIBLE_DEVICES",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable device as seen in one discovery round.
///
/// Devices are rebuilt wholesale on every refresh and never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Unique within a discovery round (GPU UUID or `<idx>-GI<gi>-CI<ci>`).
    pub id: String,

    /// Index of the owning physical device.
    pub physical_id: String,

    /// Whether this is a partition of a physical device.
    pub is_partition: bool,

    /// Partition profile name (e.g. "3g.20gb").
    pub profile: Option<String>,

    /// Health at discovery time.
    pub healthy: bool,

    pub vendor: Vendor,

    /// Device node path on the host.
    pub device_path: String,
}

impl Device {
    /// A whole, unpartitioned device.
    pub fn whole(vendor: Vendor, id: impl Into<String>, physical_id: impl Into<String>) -> Self {
        let physical_id = physical_id.into();
        Self {
            id: id.into(),
            device_path: vendor.device_node(&physical_id),
            physical_id,
            is_partition: false,
            profile: None,
            healthy: true,
            vendor,
        }
    }

    /// A partition carved out of physical device `physical_id`.
    pub fn partition(
        vendor: Vendor,
        id: impl Into<String>,
        physical_id: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        let physical_id = physical_id.into();
        Self {
            id: id.into(),
            device_path: vendor.device_node(&physical_id),
            physical_id,
            is_partition: true,
            profile: Some(profile.into()),
            healthy: true,
            vendor,
        }
    }

    pub fn path(&self) -> &str {
        &self.device_path
    }
}

/// A vendor-specific device manager.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Enumerate devices, served from cache inside the TTL window.
    async fn discover_devices(&self) -> Result<Vec<Device>, DiscoveryError>;

    /// Probe a device's health. Any failure reports unhealthy.
    async fn check_health(&self, device_id: &str) -> bool;

    /// Partition management capability, when the vendor supports it.
    fn partitioner(&self) -> Option<&dyn PartitionConfigurator> {
        None
    }
}
