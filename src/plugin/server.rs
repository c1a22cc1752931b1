//! Device-plugin protocol server.
//!
//! Owns the device-list watch state machine and the allocation handler for
//! one vendor. A watch pushes once on connect and then again on every tick
//! or health signal until it is stopped or its sink fails.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allocator::{AllocatorError, DeviceAllocator};
use crate::device::tool::HOST_LIB_DIR;
use crate::device::{Device, DeviceManager, DiscoveryError, Vendor};
use crate::metrics::PluginMetrics;
use crate::plugin::api::{
    AllocateRequest, AllocateResponse, ApiDevice, CdiDevice, ContainerAllocateResponse, DevicePluginOptions,
    DeviceSpec, ListAndWatchResponse, Mount, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use crate::workload::{CallerContext, WorkloadDirectory};

/// Default period between unsolicited pushes on a watch.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(10);

const NVIDIA_CONTROL_NODES: [&str; 4] = [
    "/dev/nvidiactl",
    "/dev/nvidia-uvm",
    "/dev/nvidia-uvm-tools",
    "/dev/nvidia-modeset",
];
const NVIDIA_CAPS_DIR: &str = "/dev/nvidia-caps";

#[derive(Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("device {device_id} already allocated to {owner:?}")]
    AlreadyAllocated { device_id: String, owner: String },

    #[error("device {0} not found in the last discovery")]
    UnknownDevice(String),

    #[error("watch stream closed by the receiver")]
    StreamClosed,
}

impl From<AllocatorError> for PluginError {
    fn from(err: AllocatorError) -> Self {
        match err {
            AllocatorError::AlreadyAllocated { device_id, owner } => {
                PluginError::AlreadyAllocated { device_id, owner }
            }
        }
    }
}

/// Lifecycle of one device-list watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Initial,
    Streaming,
    Stopped,
    Faulted,
}

/// Container-runtime device interface settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdiSettings {
    pub enabled: bool,
    pub prefix: String,
}

impl Default for CdiSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: "cdi".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub watch_interval: Duration,
    pub cdi: CdiSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            watch_interval: DEFAULT_WATCH_INTERVAL,
            cdi: CdiSettings::default(),
        }
    }
}

enum Trigger {
    Tick,
    Health(String),
}

pub struct DevicePluginServer {
    vendor: Vendor,
    manager: Arc<dyn DeviceManager>,
    allocator: Arc<DeviceAllocator>,
    directory: Arc<dyn WorkloadDirectory>,
    settings: ServerSettings,
    metrics: Option<PluginMetrics>,

    /// Devices of the last push, used to resolve allocation requests.
    index: RwLock<HashMap<String, Device>>,

    /// Single-slot health signal: a pending notification absorbs later ones.
    health_tx: mpsc::Sender<String>,
    health_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,

    stop: CancellationToken,
}

impl DevicePluginServer {
    pub fn new(
        manager: Arc<dyn DeviceManager>,
        allocator: Arc<DeviceAllocator>,
        directory: Arc<dyn WorkloadDirectory>,
        settings: ServerSettings,
    ) -> Self {
        let (health_tx, health_rx) = mpsc::channel(1);
        Self {
            vendor: manager.vendor(),
            manager,
            allocator,
            directory,
            settings,
            metrics: None,
            index: RwLock::new(HashMap::new()),
            health_tx,
            health_rx: tokio::sync::Mutex::new(health_rx),
            stop: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: PluginMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn manager(&self) -> &Arc<dyn DeviceManager> {
        &self.manager
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }

    pub fn directory(&self) -> &Arc<dyn WorkloadDirectory> {
        &self.directory
    }

    pub fn metrics(&self) -> Option<&PluginMetrics> {
        self.metrics.as_ref()
    }

    /// Token that ends every watch on this server when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        info!(vendor = %self.vendor, "Stopping device plugin watches");
        self.stop.cancel();
    }

    /// Queue a health-change push. Returns false when one is already pending.
    pub fn notify_health_change(&self, device_id: &str) -> bool {
        match self.health_tx.try_send(device_id.to_string()) {
            Ok(()) => true,
            Err(_) => {
                debug!(vendor = %self.vendor, device = device_id, "Health signal already pending, dropped");
                false
            }
        }
    }

    // ─── Watch ─────────────────────────────────────────────────────────────

    /// Run one device-list watch, pushing into `sink` until stopped or
    /// faulted. Returns the terminal state.
    pub async fn list_and_watch(&self, sink: mpsc::Sender<ListAndWatchResponse>) -> WatchState {
        let mut state = WatchState::Initial;
        let mut last_health: HashMap<String, bool> = HashMap::new();
        debug!(vendor = %self.vendor, ?state, "Watch opened");

        if let Err(e) = self.push(&sink, &mut last_health).await {
            error!(vendor = %self.vendor, "Initial device push failed: {e}");
            return WatchState::Faulted;
        }
        state = WatchState::Streaming;
        debug!(vendor = %self.vendor, ?state, "Watch streaming");

        let period = self.settings.watch_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        // A slow push must not be followed by a burst of catch-up pushes.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    info!(vendor = %self.vendor, "Watch stopped");
                    return WatchState::Stopped;
                }
                _ = sink.closed() => {
                    warn!(vendor = %self.vendor, "Watch receiver went away");
                    return WatchState::Faulted;
                }
                Some(device) = async { self.health_rx.lock().await.recv().await } => Trigger::Health(device),
                _ = ticker.tick() => Trigger::Tick,
            };

            match trigger {
                Trigger::Health(device) => {
                    info!(vendor = %self.vendor, device = %device, "Health change, refreshing device list");
                }
                Trigger::Tick => debug!(vendor = %self.vendor, "Periodic device refresh"),
            }

            if let Err(e) = self.push(&sink, &mut last_health).await {
                error!(vendor = %self.vendor, "Device push failed, closing watch: {e}");
                return WatchState::Faulted;
            }
        }
    }

    /// Discover, annotate health, reconcile allocations and send one list.
    async fn push(
        &self,
        sink: &mpsc::Sender<ListAndWatchResponse>,
        last_health: &mut HashMap<String, bool>,
    ) -> Result<(), PluginError> {
        let devices = self.manager.discover_devices().await?;

        let mut listed = Vec::with_capacity(devices.len());
        for device in &devices {
            let healthy = self.manager.check_health(&device.id).await;
            if let Some(previous) = last_health.insert(device.id.clone(), healthy) {
                if previous != healthy {
                    info!(vendor = %self.vendor, device = %device.id, healthy, "Device health changed");
                }
            }
            listed.push(ApiDevice::new(&device.id, healthy));
        }

        let discovered: HashSet<String> = devices.iter().map(|d| d.id.clone()).collect();
        last_health.retain(|id, _| discovered.contains(id));
        let orphaned = self.allocator.cleanup_orphaned(&discovered);
        if !orphaned.is_empty() {
            info!(vendor = %self.vendor, released = orphaned.len(), "Released allocations of vanished devices");
        }

        *self.index.write().unwrap_or_else(|e| e.into_inner()) =
            devices.into_iter().map(|d| (d.id.clone(), d)).collect();

        let healthy = listed.iter().filter(|d| d.is_healthy()).count();
        info!(
            vendor = %self.vendor,
            devices = listed.len(),
            healthy,
            unhealthy = listed.len() - healthy,
            "Pushing device list"
        );
        if let Some(metrics) = &self.metrics {
            metrics.observe_push(listed.len(), healthy);
            metrics.set_allocated(self.allocator.len());
        }

        sink.send(ListAndWatchResponse { devices: listed })
            .await
            .map_err(|_| PluginError::StreamClosed)
    }

    // ─── Allocate ──────────────────────────────────────────────────────────

    /// Allocate devices for every container in `request`.
    ///
    /// Containers are committed one at a time; a failure in a later
    /// container leaves earlier containers' devices allocated.
    pub async fn allocate(
        &self,
        request: AllocateRequest,
        caller: &CallerContext,
    ) -> Result<AllocateResponse, PluginError> {
        let request_id = Uuid::new_v4().to_string();
        info!(
            request_id = %request_id,
            vendor = %self.vendor,
            containers = request.container_requests.len(),
            "Allocate request"
        );

        let mut responses = Vec::with_capacity(request.container_requests.len());
        for container in &request.container_requests {
            let ids = &container.devices_ids;
            let devices = self.resolve(ids)?;

            for id in ids {
                if self.allocator.is_available(id) {
                    continue;
                }
                let owner = self.allocator.owner(id);
                if !owner.is_empty() && self.directory.is_active(&owner).await {
                    warn!(request_id = %request_id, device = %id, owner = %owner, "Device held by an active workload");
                    self.count_conflict();
                    return Err(PluginError::AlreadyAllocated {
                        device_id: id.clone(),
                        owner,
                    });
                }
                info!(request_id = %request_id, device = %id, owner = %owner, "Reclaiming stale allocation");
                self.allocator.deallocate(&[id]);
            }

            let identity = self.directory.resolve_caller(caller).await;
            if let Err(e) = self.allocator.allocate(ids, &identity) {
                self.count_conflict();
                return Err(e.into());
            }
            if let Some(metrics) = &self.metrics {
                metrics.allocation();
            }

            info!(request_id = %request_id, devices = ?ids, owner = %identity, "Container allocation committed");
            responses.push(self.container_response(ids, &devices));
        }

        if let Some(metrics) = &self.metrics {
            metrics.set_allocated(self.allocator.len());
        }
        Ok(AllocateResponse {
            container_responses: responses,
        })
    }

    fn count_conflict(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.conflict();
        }
    }

    fn resolve(&self, ids: &[String]) -> Result<Vec<Device>, PluginError> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        ids.iter()
            .map(|id| {
                index
                    .get(id)
                    .cloned()
                    .ok_or_else(|| PluginError::UnknownDevice(id.clone()))
            })
            .collect()
    }

    fn container_response(&self, ids: &[String], devices: &[Device]) -> ContainerAllocateResponse {
        let mut resp = ContainerAllocateResponse::default();
        resp.envs.insert(self.vendor.visibility_env().to_string(), ids.join(","));

        if self.settings.cdi.enabled {
            let resource = self.vendor.resource_name();
            resp.cdi_devices = ids
                .iter()
                .map(|id| CdiDevice {
                    name: format!("{}/{resource}={id}", self.settings.cdi.prefix),
                })
                .collect();
            let names: Vec<&str> = resp.cdi_devices.iter().map(|d| d.name.as_str()).collect();
            resp.envs.insert("CDI_DEVICES".to_string(), names.join(","));
            return resp;
        }

        // Sorted so responses are stable across calls.
        let physical: BTreeSet<&str> = devices.iter().map(|d| d.physical_id.as_str()).collect();
        for id in &physical {
            resp.devices
                .push(DeviceSpec::passthrough(self.vendor.device_node(id), "rwm"));
        }

        if self.vendor == Vendor::Nvidia {
            resp.envs.insert(
                "NVIDIA_DRIVER_CAPABILITIES".to_string(),
                "compute,utility".to_string(),
            );
            resp.envs.insert(
                "LD_LIBRARY_PATH".to_string(),
                "/usr/lib/x86_64-linux-gnu:/usr/local/nvidia/lib:/usr/local/nvidia/lib64:$LD_LIBRARY_PATH"
                    .to_string(),
            );
            resp.envs
                .insert("PATH".to_string(), "/usr/local/nvidia/bin:$PATH".to_string());

            resp.mounts.push(Mount {
                container_path: "/usr/local/nvidia/bin".to_string(),
                host_path: "/usr/bin".to_string(),
                read_only: true,
            });
            resp.mounts.push(Mount {
                container_path: HOST_LIB_DIR.to_string(),
                host_path: HOST_LIB_DIR.to_string(),
                read_only: true,
            });

            for node in NVIDIA_CONTROL_NODES {
                resp.devices.push(DeviceSpec::passthrough(node, "rwm"));
            }
            if devices.iter().any(|d| d.is_partition) {
                resp.devices.push(DeviceSpec::passthrough(NVIDIA_CAPS_DIR, "rw"));
            }
        }
        resp
    }

    // ─── Trivial RPCs ──────────────────────────────────────────────────────

    pub fn options(&self) -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }
    }

    pub fn pre_start_container(&self, _request: PreStartContainerRequest) -> PreStartContainerResponse {
        PreStartContainerResponse {}
    }

    pub fn preferred_allocation(&self, _request: PreferredAllocationRequest) -> PreferredAllocationResponse {
        PreferredAllocationResponse::default()
    }
}
