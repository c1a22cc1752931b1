//! Background health polling that nudges open watches on change.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::plugin::server::DevicePluginServer;

/// Default period between health sweeps.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

pub struct HealthMonitor {
    server: Arc<DevicePluginServer>,
    /// Last observed health per device, seeded from discovery.
    observed: HashMap<String, bool>,
}

impl HealthMonitor {
    pub fn new(server: Arc<DevicePluginServer>) -> Self {
        Self {
            server,
            observed: HashMap::new(),
        }
    }

    /// One sweep. Returns the devices whose health changed.
    pub async fn sweep(&mut self) -> Vec<String> {
        let vendor = self.server.vendor();
        let manager = self.server.manager().clone();
        let devices = match manager.discover_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                error!(vendor = %vendor, "Discovery failed during health sweep: {e}");
                return Vec::new();
            }
        };

        let mut changed = Vec::new();
        let mut seen = HashMap::with_capacity(devices.len());
        for device in devices {
            let previous = self.observed.get(&device.id).copied().unwrap_or(device.healthy);
            let current = manager.check_health(&device.id).await;
            if current != previous {
                warn!(vendor = %vendor, device = %device.id, from = previous, to = current, "Device health changed");
                self.server.notify_health_change(&device.id);
                changed.push(device.id.clone());
            }
            seen.insert(device.id, current);
        }
        self.observed = seen;
        changed
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        info!(vendor = %self.server.vendor(), interval_secs = interval.as_secs(), "Starting health checks");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(vendor = %self.server.vendor(), "Stopping health checks");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::allocator::DeviceAllocator;
    use crate::device::{Device, DeviceManager, DiscoveryError, Vendor};
    use crate::plugin::server::{ServerSettings, WatchState};
    use crate::workload::InMemoryDirectory;

    struct Toggle {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl DeviceManager for Toggle {
        fn vendor(&self) -> Vendor {
            Vendor::Simulator
        }

        async fn discover_devices(&self) -> Result<Vec<Device>, DiscoveryError> {
            Ok(vec![Device::whole(Vendor::Simulator, "0", "0")])
        }

        async fn check_health(&self, _device_id: &str) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn server(manager: Arc<Toggle>) -> Arc<DevicePluginServer> {
        Arc::new(DevicePluginServer::new(
            manager,
            Arc::new(DeviceAllocator::new()),
            Arc::new(InMemoryDirectory::new()),
            ServerSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_sweep_reports_transitions_only() {
        let manager = Arc::new(Toggle {
            healthy: AtomicBool::new(true),
        });
        let mut monitor = HealthMonitor::new(server(manager.clone()));

        assert!(monitor.sweep().await.is_empty());

        manager.healthy.store(false, Ordering::SeqCst);
        assert_eq!(monitor.sweep().await, vec!["0".to_string()]);
        assert!(monitor.sweep().await.is_empty());

        manager.healthy.store(true, Ordering::SeqCst);
        assert_eq!(monitor.sweep().await, vec!["0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_triggers_watch_push() {
        let manager = Arc::new(Toggle {
            healthy: AtomicBool::new(true),
        });
        let server = server(manager.clone());
        let (tx, mut rx) = mpsc::channel(4);
        let watch = tokio::spawn({
            let server = server.clone();
            async move { server.list_and_watch(tx).await }
        });
        rx.recv().await.unwrap();

        let shutdown = CancellationToken::new();
        let monitor = tokio::spawn(HealthMonitor::new(server.clone()).run(Duration::from_secs(3), shutdown.clone()));

        manager.healthy.store(false, Ordering::SeqCst);
        // Pushed by the health signal well before the 10s tick.
        let push = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(!push.devices[0].is_healthy());

        shutdown.cancel();
        monitor.await.unwrap();
        server.stop();
        assert_eq!(watch.await.unwrap(), WatchState::Stopped);
    }
}
