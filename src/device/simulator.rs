//! Synthetic devices for running the plugin without accelerators.

use async_trait::async_trait;
use tracing::debug;

use crate::device::{Device, DeviceManager, DiscoveryError, Vendor};

/// Three always-present devices whose health flaps roughly one check in ten.
#[derive(Debug, Default)]
pub struct SimulatorManager;

impl SimulatorManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceManager for SimulatorManager {
    fn vendor(&self) -> Vendor {
        Vendor::Simulator
    }

    async fn discover_devices(&self) -> Result<Vec<Device>, DiscoveryError> {
        Ok(["0", "1", "2"]
            .into_iter()
            .map(|id| Device::whole(Vendor::Simulator, id, id))
            .collect())
    }

    async fn check_health(&self, device_id: &str) -> bool {
        let healthy = !rand::random_ratio(1, 10);
        debug!(device = device_id, healthy, "Simulated health check");
        healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_inventory() {
        let devices = SimulatorManager::new().discover_devices().await.unwrap();
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
        assert_eq!(devices[2].path(), "/dev/sim_gpu2");
    }

    #[tokio::test]
    async fn test_health_mostly_up_with_occasional_failures() {
        let sim = SimulatorManager::new();
        let mut unhealthy = 0;
        for _ in 0..2_000 {
            if !sim.check_health("1").await {
                unhealthy += 1;
            }
        }
        // Expected around 200; the bounds are many deviations wide.
        assert!((100..=320).contains(&unhealthy), "unhealthy = {unhealthy}");
    }
}
