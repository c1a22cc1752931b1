//! Device-plugin protocol endpoint for one vendor.
//!
//! - [`api`]: wire types
//! - [`server`]: watch state machine and allocation handler
//! - [`health`]: periodic health sweeps feeding the watch
//! - [`transport`]: HTTP/JSON binding on the plugin socket
//! - [`registration`]: kubelet registration handshake

pub mod api;
pub mod health;
pub mod registration;
pub mod server;
pub mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::partition::PartitionReport;
use crate::recycler::{ResourceRecycler, DEFAULT_RECYCLE_INTERVAL};
use api::{RegisterRequest, API_VERSION};
use health::{HealthMonitor, DEFAULT_HEALTH_INTERVAL};
use registration::{RegistrationError, DEFAULT_KUBELET_SOCKET};
use server::DevicePluginServer;
use transport::{TransportError, DEFAULT_SOCKET_WAIT};

/// Default directory holding plugin and kubelet sockets.
pub const DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";

#[derive(Error, Debug)]
pub enum StartError {
    #[error("cannot create plugin directory {path}: {source}")]
    PluginDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Where and how a plugin is exposed.
#[derive(Debug, Clone)]
pub struct PluginEndpoint {
    pub plugin_dir: PathBuf,
    /// Kubelet registration socket; `None` skips registration.
    pub kubelet_socket: Option<PathBuf>,
    pub socket_wait: Duration,
    pub health_interval: Duration,
    pub recycle_interval: Duration,
}

impl Default for PluginEndpoint {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            kubelet_socket: Some(PathBuf::from(DEFAULT_KUBELET_SOCKET)),
            socket_wait: DEFAULT_SOCKET_WAIT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            recycle_interval: DEFAULT_RECYCLE_INTERVAL,
        }
    }
}

/// A started, registered plugin and its background tasks.
pub struct RunningPlugin {
    server: Arc<DevicePluginServer>,
    socket: PathBuf,
    serve_task: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl RunningPlugin {
    pub fn server(&self) -> &Arc<DevicePluginServer> {
        &self.server
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// End every watch, shut the listener down and remove the socket.
    ///
    /// Background workers stop with the shared shutdown token passed to
    /// [`start`]; this waits for them too.
    pub async fn stop(self) {
        let vendor = self.server.vendor();
        self.server.stop();
        if tokio::time::timeout(Duration::from_secs(5), self.serve_task).await.is_err() {
            warn!(vendor = %vendor, "Plugin server did not drain in time");
        }
        for worker in self.workers {
            let _ = worker.await;
        }
        if let Err(e) = std::fs::remove_file(&self.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(socket = %self.socket.display(), "Failed to remove socket: {e}");
            }
        }
        info!(vendor = %vendor, "Device plugin stopped");
    }
}

/// Bring one vendor plugin up: partition, serve, register, spawn workers.
pub async fn start(
    server: Arc<DevicePluginServer>,
    endpoint: &PluginEndpoint,
    shutdown: CancellationToken,
) -> Result<RunningPlugin, StartError> {
    let vendor = server.vendor();
    info!(vendor = %vendor, "Starting device plugin");

    tokio::fs::create_dir_all(&endpoint.plugin_dir)
        .await
        .map_err(|source| StartError::PluginDir {
            path: endpoint.plugin_dir.clone(),
            source,
        })?;

    if let Some(partitioner) = server.manager().partitioner() {
        match partitioner.configure_partitions().await {
            PartitionReport::Completed(outcomes) => {
                info!(vendor = %vendor, gpus = outcomes.len(), "Partition reconciliation completed");
            }
            PartitionReport::ProbeFailed(reason) => {
                warn!(vendor = %vendor, reason = %reason, "Partition probe failed, serving current layout");
            }
            report => info!(vendor = %vendor, ?report, "Partition reconciliation skipped"),
        }
    }

    let socket = endpoint.plugin_dir.join(vendor.socket_name());
    let listener = transport::bind(&socket)?;
    let router = transport::build_router(server.clone());
    let stop = server.stop_token();
    let serve_task = tokio::spawn(async move {
        let shutdown = async move { stop.cancelled().await };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
            error!(vendor = %vendor, "Plugin server failed: {e}");
        }
    });

    let ready = async {
        transport::wait_for_socket(&socket, endpoint.socket_wait).await?;
        if let Some(kubelet) = &endpoint.kubelet_socket {
            let request = RegisterRequest {
                version: API_VERSION.to_string(),
                endpoint: vendor.socket_name(),
                resource_name: vendor.resource_name(),
            };
            registration::register(kubelet, &request).await?;
        }
        Ok::<(), StartError>(())
    };
    if let Err(e) = ready.await {
        server.stop();
        serve_task.abort();
        let _ = std::fs::remove_file(&socket);
        return Err(e);
    }

    let health = HealthMonitor::new(server.clone());
    let mut recycler = ResourceRecycler::new(server.allocator().clone(), server.directory().clone());
    if let Some(metrics) = server.metrics() {
        recycler = recycler.with_metrics(metrics.clone());
    }
    let workers = vec![
        tokio::spawn(health.run(endpoint.health_interval, shutdown.clone())),
        tokio::spawn(recycler.run(endpoint.recycle_interval, shutdown)),
    ];

    info!(
        vendor = %vendor,
        resource = %vendor.resource_name(),
        socket = %socket.display(),
        "Device plugin started"
    );
    Ok(RunningPlugin {
        server,
        socket,
        serve_task,
        workers,
    })
}
