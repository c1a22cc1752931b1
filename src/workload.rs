//! Workload identity and liveness.
//!
//! The allocation handler records who owns a device; the recycler later
//! asks whether that owner is still alive. Both questions go through a
//! [`WorkloadDirectory`]. Every lookup failure answers "not active", so a
//! transient outage of the backing source can release a live workload's
//! devices early.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Header carrying the caller's workload ID on allocation requests.
pub const WORKLOAD_ID_HEADER: &str = "x-workload-id";
pub const POD_NAME_HEADER: &str = "x-pod-name";
pub const POD_NAMESPACE_HEADER: &str = "x-pod-namespace";

/// What is known about the caller of an allocation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub workload_id: Option<String>,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
}

impl CallerContext {
    pub fn with_workload_id(id: impl Into<String>) -> Self {
        Self {
            workload_id: Some(id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Terminating,
    Unknown,
}

impl WorkloadPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, WorkloadPhase::Pending | WorkloadPhase::Running)
    }
}

#[async_trait]
pub trait WorkloadDirectory: Send + Sync {
    /// Stable identifier of the caller, empty when it cannot be resolved.
    async fn resolve_caller(&self, caller: &CallerContext) -> String;

    /// Whether the workload is running or pending. Lookup failures and
    /// unknown IDs report `false`.
    async fn is_active(&self, workload_id: &str) -> bool;
}

/// Workload phases held in memory, keyed by workload ID.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    phases: RwLock<HashMap<String, WorkloadPhase>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&self, workload_id: impl Into<String>, phase: WorkloadPhase) {
        self.phases
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workload_id.into(), phase);
    }

    pub fn remove(&self, workload_id: &str) {
        self.phases
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(workload_id);
    }
}

#[async_trait]
impl WorkloadDirectory for InMemoryDirectory {
    async fn resolve_caller(&self, caller: &CallerContext) -> String {
        caller.workload_id.clone().unwrap_or_default()
    }

    async fn is_active(&self, workload_id: &str) -> bool {
        self.phases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(workload_id)
            .is_some_and(WorkloadPhase::is_active)
    }
}

// ─── Kubelet pod listing ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMetadata {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    deletion_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
}

impl Pod {
    fn phase(&self) -> WorkloadPhase {
        if self.metadata.deletion_timestamp.is_some() {
            return WorkloadPhase::Terminating;
        }
        match self.status.phase.as_deref() {
            Some("Pending") => WorkloadPhase::Pending,
            Some("Running") => WorkloadPhase::Running,
            Some("Succeeded") => WorkloadPhase::Succeeded,
            Some("Failed") => WorkloadPhase::Failed,
            _ => WorkloadPhase::Unknown,
        }
    }
}

/// Resolves workloads against the kubelet's `/pods` listing. Pod UIDs are
/// the workload IDs.
#[derive(Debug, Clone)]
pub struct KubeletDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl KubeletDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, reqwest::Error> {
        let list: PodList = self
            .client
            .get(format!("{}/pods", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list.items)
    }
}

#[async_trait]
impl WorkloadDirectory for KubeletDirectory {
    async fn resolve_caller(&self, caller: &CallerContext) -> String {
        if let Some(id) = caller.workload_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let (Some(name), Some(namespace)) = (&caller.pod_name, &caller.pod_namespace) else {
            return String::new();
        };

        match self.list_pods().await {
            Ok(pods) => pods
                .into_iter()
                .find(|p| &p.metadata.name == name && &p.metadata.namespace == namespace)
                .map(|p| p.metadata.uid)
                .unwrap_or_default(),
            Err(e) => {
                warn!(pod = %name, namespace = %namespace, "Failed to resolve caller: {e}");
                String::new()
            }
        }
    }

    async fn is_active(&self, workload_id: &str) -> bool {
        let pods = match self.list_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(workload = workload_id, "Liveness lookup failed, treating as inactive: {e}");
                return false;
            }
        };

        let phase = pods
            .iter()
            .find(|p| p.metadata.uid == workload_id)
            .map(Pod::phase)
            .unwrap_or(WorkloadPhase::Unknown);
        debug!(workload = workload_id, ?phase, "Workload phase");
        phase.is_active()
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_in_memory_directory() {
        let dir = InMemoryDirectory::new();
        dir.set_phase("pod-a", WorkloadPhase::Running);
        dir.set_phase("pod-b", WorkloadPhase::Succeeded);

        assert!(dir.is_active("pod-a").await);
        assert!(!dir.is_active("pod-b").await);
        assert!(!dir.is_active("pod-c").await);

        dir.remove("pod-a");
        assert!(!dir.is_active("pod-a").await);

        assert_eq!(dir.resolve_caller(&CallerContext::with_workload_id("pod-a")).await, "pod-a");
        assert_eq!(dir.resolve_caller(&CallerContext::default()).await, "");
    }

    async fn serve_pods(body: serde_json::Value) -> String {
        let app = Router::new().route("/pods", get(move || async move { Json(body) }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_kubelet_directory_phases() {
        let url = serve_pods(serde_json::json!({
            "kind": "PodList",
            "items": [
                {"metadata": {"uid": "u-run", "name": "train", "namespace": "ml"}, "status": {"phase": "Running"}},
                {"metadata": {"uid": "u-done", "name": "batch", "namespace": "ml"}, "status": {"phase": "Succeeded"}},
                {"metadata": {"uid": "u-del", "name": "old", "namespace": "ml",
                              "deletionTimestamp": "2026-01-01T00:00:00Z"}, "status": {"phase": "Running"}},
                {"metadata": {"uid": "u-new", "name": "queued", "namespace": "ml"}, "status": {"phase": "Pending"}}
            ]
        }))
        .await;
        let dir = KubeletDirectory::new(url, Duration::from_secs(2)).unwrap();

        assert!(dir.is_active("u-run").await);
        assert!(dir.is_active("u-new").await);
        assert!(!dir.is_active("u-done").await);
        assert!(!dir.is_active("u-del").await);
        assert!(!dir.is_active("u-missing").await);

        let caller = CallerContext {
            workload_id: None,
            pod_name: Some("train".to_string()),
            pod_namespace: Some("ml".to_string()),
        };
        assert_eq!(dir.resolve_caller(&caller).await, "u-run");
    }

    #[tokio::test]
    async fn test_kubelet_unreachable_is_inactive() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = KubeletDirectory::new(format!("http://{addr}"), Duration::from_millis(500)).unwrap();
        assert!(!dir.is_active("u-run").await);
        let caller = CallerContext {
            workload_id: None,
            pod_name: Some("train".to_string()),
            pod_namespace: Some("ml".to_string()),
        };
        assert_eq!(dir.resolve_caller(&caller).await, "");
    }
}
