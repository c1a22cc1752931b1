//! Wire types of the resource-advertisement protocol (JSON, camelCase).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "v1beta1";
pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginOptions {
    pub pre_start_required: bool,
    pub get_preferred_allocation_available: bool,
}

/// One advertised device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDevice {
    pub id: String,
    pub health: String,
}

impl ApiDevice {
    pub fn new(id: impl Into<String>, healthy: bool) -> Self {
        Self {
            id: id.into(),
            health: if healthy { HEALTHY } else { UNHEALTHY }.to_string(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HEALTHY
    }
}

/// One push on the device-list watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAndWatchResponse {
    pub devices: Vec<ApiDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    pub container_requests: Vec<ContainerAllocateRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerAllocateRequest {
    #[serde(default)]
    pub devices_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateResponse {
    pub container_responses: Vec<ContainerAllocateResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerAllocateResponse {
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub cdi_devices: Vec<CdiDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub container_path: String,
    pub host_path: String,
    pub permissions: String,
}

impl DeviceSpec {
    /// Same path inside and outside the container.
    pub fn passthrough(path: impl Into<String>, permissions: &str) -> Self {
        let path = path.into();
        Self {
            container_path: path.clone(),
            host_path: path,
            permissions: permissions.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdiDevice {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreStartContainerRequest {
    #[serde(default)]
    pub devices_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreStartContainerResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferredAllocationRequest {
    #[serde(default)]
    pub container_requests: Vec<ContainerPreferredAllocationRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPreferredAllocationRequest {
    #[serde(default)]
    pub available_device_ids: Vec<String>,
    #[serde(default)]
    pub must_include_device_ids: Vec<String>,
    #[serde(default)]
    pub allocation_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferredAllocationResponse {
    pub container_responses: Vec<ContainerPreferredAllocationResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPreferredAllocationResponse {
    pub device_ids: Vec<String>,
}

/// Registration handshake body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub version: String,
    pub endpoint: String,
    pub resource_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let req: AllocateRequest =
            serde_json::from_str(r#"{"containerRequests":[{"devicesIds":["0-GI1-CI0"]}]}"#).unwrap();
        assert_eq!(req.container_requests[0].devices_ids, vec!["0-GI1-CI0"]);

        let opts = serde_json::to_value(DevicePluginOptions::default()).unwrap();
        assert_eq!(
            opts,
            serde_json::json!({"preStartRequired": false, "getPreferredAllocationAvailable": false})
        );

        let push = ListAndWatchResponse {
            devices: vec![ApiDevice::new("0", true), ApiDevice::new("1", false)],
        };
        assert_eq!(
            serde_json::to_value(push).unwrap(),
            serde_json::json!({"devices": [{"id": "0", "health": "Healthy"}, {"id": "1", "health": "Unhealthy"}]})
        );
    }
}
