//! HTTP/JSON binding of the protocol on a Unix socket.
//!
//! - GET  /v1beta1/options
//! - GET  /v1beta1/list-and-watch (server-sent events)
//! - POST /v1beta1/allocate
//! - POST /v1beta1/prestart
//! - POST /v1beta1/preferred-allocation

use std::convert::Infallible;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::plugin::api::{
    AllocateRequest, AllocateResponse, DevicePluginOptions, ErrorBody, PreStartContainerRequest,
    PreStartContainerResponse, PreferredAllocationRequest, PreferredAllocationResponse,
};
use crate::plugin::server::{DevicePluginServer, PluginError};
use crate::workload::{CallerContext, POD_NAMESPACE_HEADER, POD_NAME_HEADER, WORKLOAD_ID_HEADER};

/// Default bound on waiting for a freshly bound socket to accept.
pub const DEFAULT_SOCKET_WAIT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("socket {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("socket {0} did not accept connections in time")]
    NotReady(PathBuf),
}

pub fn build_router(server: Arc<DevicePluginServer>) -> Router {
    Router::new()
        .route("/v1beta1/options", get(options))
        .route("/v1beta1/list-and-watch", get(list_and_watch))
        .route("/v1beta1/allocate", post(allocate))
        .route("/v1beta1/prestart", post(prestart))
        .route("/v1beta1/preferred-allocation", post(preferred_allocation))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(server)
}

impl IntoResponse for PluginError {
    fn into_response(self) -> Response {
        let status = match &self {
            PluginError::AlreadyAllocated { .. } => StatusCode::CONFLICT,
            PluginError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn caller_from_headers(headers: &HeaderMap) -> CallerContext {
    CallerContext {
        workload_id: header(headers, WORKLOAD_ID_HEADER),
        pod_name: header(headers, POD_NAME_HEADER),
        pod_namespace: header(headers, POD_NAMESPACE_HEADER),
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn options(State(server): State<Arc<DevicePluginServer>>) -> Json<DevicePluginOptions> {
    Json(server.options())
}

async fn list_and_watch(
    State(server): State<Arc<DevicePluginServer>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let state = server.list_and_watch(tx).await;
        debug!(vendor = %server.vendor(), ?state, "Watch ended");
    });

    let stream = ReceiverStream::new(rx).map(|push| {
        let data = serde_json::to_string(&push).unwrap_or_default();
        Ok(Event::default().data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn allocate(
    State(server): State<Arc<DevicePluginServer>>,
    headers: HeaderMap,
    Json(req): Json<AllocateRequest>,
) -> Result<Json<AllocateResponse>, PluginError> {
    let caller = caller_from_headers(&headers);
    server.allocate(req, &caller).await.map(Json)
}

async fn prestart(
    State(server): State<Arc<DevicePluginServer>>,
    Json(req): Json<PreStartContainerRequest>,
) -> Json<PreStartContainerResponse> {
    Json(server.pre_start_container(req))
}

async fn preferred_allocation(
    State(server): State<Arc<DevicePluginServer>>,
    Json(req): Json<PreferredAllocationRequest>,
) -> Json<PreferredAllocationResponse> {
    Json(server.preferred_allocation(req))
}

// ─── Socket ────────────────────────────────────────────────────────────────

/// Bind `path`, removing a stale socket file first.
pub fn bind(path: &Path) -> Result<UnixListener, TransportError> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(TransportError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }
    let listener = UnixListener::bind(path).map_err(|source| TransportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(socket = %path.display(), "Listening");
    Ok(listener)
}

/// Poll until `path` accepts a connection or `timeout` elapses.
pub async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), TransportError> {
    let attempt = async {
        loop {
            if UnixStream::connect(path).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| TransportError::NotReady(path.to_path_buf()))
}
