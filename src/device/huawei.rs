//! Huawei Ascend NPU manager.
//!
//! The NPU SDK is not wired in yet; the node reports a fixed two-card
//! inventory that is always healthy.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::device::cache::DiscoveryCache;
use crate::device::{Device, DeviceManager, DiscoveryError, Vendor};

pub struct HuaweiManager {
    cache: DiscoveryCache,
    cards: Vec<String>,
}

impl HuaweiManager {
    pub fn new(cache: DiscoveryCache) -> Self {
        Self {
            cache,
            cards: vec!["0".to_string(), "1".to_string()],
        }
    }
}

#[async_trait]
impl DeviceManager for HuaweiManager {
    fn vendor(&self) -> Vendor {
        Vendor::Huawei
    }

    async fn discover_devices(&self) -> Result<Vec<Device>, DiscoveryError> {
        self.cache
            .get_or_refresh(|| async {
                info!("Discovering Huawei devices");
                let devices: Vec<Device> = self
                    .cards
                    .iter()
                    .map(|id| Device::whole(Vendor::Huawei, id.clone(), id.clone()))
                    .collect();
                info!(devices = devices.len(), "Discovered Huawei devices");
                Ok(devices)
            })
            .await
    }

    async fn check_health(&self, device_id: &str) -> bool {
        debug!(device = device_id, "Huawei device healthy");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_inventory() {
        let mgr = HuaweiManager::new(DiscoveryCache::default());
        let devices = mgr.discover_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].path(), "/dev/davinci1");
        assert!(mgr.check_health("1").await);
        assert!(mgr.partitioner().is_none());
    }
}
