//! Runtime configuration for microgpu-plugin.
//!
//! Defaults come from an optional JSON file; command-line flags and their
//! environment variables override individual fields. Everything is read
//! once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::device::cache::DEFAULT_DISCOVERY_TTL;
use crate::device::tool::DEFAULT_SMI_PATH;
use crate::device::Vendor;
use crate::liveness::DEFAULT_LIVENESS_ADDR;
use crate::partition::reconciler::PartitionPlan;
use crate::plugin::health::DEFAULT_HEALTH_INTERVAL;
use crate::plugin::registration::DEFAULT_KUBELET_SOCKET;
use crate::plugin::server::{CdiSettings, ServerSettings, DEFAULT_WATCH_INTERVAL};
use crate::plugin::transport::DEFAULT_SOCKET_WAIT;
use crate::plugin::{PluginEndpoint, DEFAULT_PLUGIN_DIR};
use crate::recycler::DEFAULT_RECYCLE_INTERVAL;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "microgpu-plugin", about = "GPU partitioning device plugin node agent")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, env = "MICROGPU_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// Vendors to start plugins for.
    #[arg(long, env = "PLUGIN_VENDORS", value_enum, value_delimiter = ',')]
    pub vendors: Vec<Vendor>,

    /// Directory for plugin sockets.
    #[arg(long, env = "DEVICE_PLUGIN_DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Kubelet registration socket.
    #[arg(long, env = "KUBELET_SOCKET")]
    pub kubelet_socket: Option<PathBuf>,

    /// Serve without registering with the kubelet.
    #[arg(long)]
    pub skip_registration: bool,

    /// Liveness/metrics listen address.
    #[arg(long, env = "LIVENESS_LISTEN")]
    pub listen: Option<String>,

    /// Kubelet base URL used to look up pods.
    #[arg(long, env = "KUBELET_PODS_URL")]
    pub kubelet_url: Option<String>,

    #[arg(long, env = "ENABLE_MIG", value_parser = BoolishValueParser::new())]
    pub enable_mig: Option<bool>,

    #[arg(long, env = "MIG_PROFILE")]
    pub mig_profile: Option<String>,

    /// Partitions per GPU (0 = as many as fit).
    #[arg(long, env = "MIG_INSTANCE_COUNT")]
    pub mig_instance_count: Option<u32>,

    #[arg(long, env = "SKIP_CONFIGURED", value_parser = BoolishValueParser::new())]
    pub skip_configured: Option<bool>,

    #[arg(long, env = "CDI_ENABLED", value_parser = BoolishValueParser::new())]
    pub cdi_enabled: Option<bool>,

    #[arg(long, env = "CDI_PREFIX")]
    pub cdi_prefix: Option<String>,

    /// Path to nvidia-smi.
    #[arg(long, env = "NVIDIA_SMI_PATH")]
    pub smi_path: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Serde helper storing a [`Duration`] as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Vendors to start plugins for.
    pub vendors: Vec<Vendor>,

    /// Socket placement and registration.
    pub plugin: PluginConfig,

    /// Loop periods and cache lifetime.
    pub intervals: IntervalConfig,

    /// Partition layout for NVIDIA GPUs.
    pub partition: PartitionPlan,

    /// Container device interface.
    pub cdi: CdiSettings,

    /// Vendor tool settings.
    pub tool: ToolConfig,

    /// Workload liveness source.
    pub workloads: WorkloadConfig,

    /// Liveness/metrics endpoint.
    pub liveness: LivenessConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vendors: vec![Vendor::Nvidia, Vendor::Huawei],
            plugin: PluginConfig::default(),
            intervals: IntervalConfig::default(),
            partition: PartitionPlan::default(),
            cdi: CdiSettings::default(),
            tool: ToolConfig::default(),
            workloads: WorkloadConfig::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Directory holding plugin sockets.
    pub plugin_dir: PathBuf,

    /// Kubelet registration socket.
    pub kubelet_socket: PathBuf,

    /// Register with the kubelet after the socket is up.
    pub register: bool,

    /// Upper bound on waiting for the plugin socket.
    #[serde(with = "duration_secs")]
    pub socket_wait: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            kubelet_socket: PathBuf::from(DEFAULT_KUBELET_SOCKET),
            register: true,
            socket_wait: DEFAULT_SOCKET_WAIT,
        }
    }
}

/// Periods in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    #[serde(with = "duration_secs")]
    pub watch: Duration,

    #[serde(with = "duration_secs")]
    pub health: Duration,

    #[serde(with = "duration_secs")]
    pub recycle: Duration,

    #[serde(with = "duration_secs")]
    pub discovery_ttl: Duration,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            watch: DEFAULT_WATCH_INTERVAL,
            health: DEFAULT_HEALTH_INTERVAL,
            recycle: DEFAULT_RECYCLE_INTERVAL,
            discovery_ttl: DEFAULT_DISCOVERY_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub smi_path: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            smi_path: PathBuf::from(DEFAULT_SMI_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Kubelet base URL serving `/pods`. `None` keeps workloads in memory,
    /// which makes every recorded owner look inactive.
    pub kubelet_url: Option<String>,

    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            kubelet_url: Some("http://127.0.0.1:10255".to_string()),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub listen: String,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LIVENESS_ADDR.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Overlay values given on the command line or through the environment.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if !cli.vendors.is_empty() {
            self.vendors = cli.vendors.clone();
        }
        if let Some(dir) = &cli.plugin_dir {
            self.plugin.plugin_dir = dir.clone();
        }
        if let Some(socket) = &cli.kubelet_socket {
            self.plugin.kubelet_socket = socket.clone();
        }
        if cli.skip_registration {
            self.plugin.register = false;
        }
        if let Some(listen) = &cli.listen {
            self.liveness.listen = listen.clone();
        }
        if let Some(url) = &cli.kubelet_url {
            self.workloads.kubelet_url = Some(url.clone()).filter(|u| !u.is_empty());
        }
        if let Some(enabled) = cli.enable_mig {
            self.partition.enabled = enabled;
        }
        if let Some(profile) = cli.mig_profile.as_ref().filter(|p| !p.is_empty()) {
            self.partition.profile = profile.clone();
        }
        if let Some(count) = cli.mig_instance_count {
            self.partition.instance_count = count;
        }
        if let Some(skip) = cli.skip_configured {
            self.partition.skip_configured = skip;
        }
        if let Some(enabled) = cli.cdi_enabled {
            self.cdi.enabled = enabled;
        }
        if let Some(prefix) = &cli.cdi_prefix {
            self.cdi.prefix = prefix.clone();
        }
        if let Some(path) = cli.smi_path.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            self.tool.smi_path = path.clone();
        }
    }

    pub fn endpoint(&self) -> PluginEndpoint {
        PluginEndpoint {
            plugin_dir: self.plugin.plugin_dir.clone(),
            kubelet_socket: self.plugin.register.then(|| self.plugin.kubelet_socket.clone()),
            socket_wait: self.plugin.socket_wait,
            health_interval: self.intervals.health,
            recycle_interval: self.intervals.recycle,
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            watch_interval: self.intervals.watch,
            cdi: self.cdi.clone(),
        }
    }
}
