//! Registration handshake with the kubelet over its Unix socket.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::plugin::api::RegisterRequest;

/// Kubelet registration socket.
pub const DEFAULT_KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("cannot reach kubelet at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registration transport error: {0}")]
    Http(#[from] hyper::Error),

    #[error("malformed registration request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("failed to encode registration: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("kubelet rejected registration with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Register `request` with the kubelet listening on `socket`.
pub async fn register(socket: &Path, request: &RegisterRequest) -> Result<(), RegistrationError> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|source| RegistrationError::Connect {
            path: socket.to_path_buf(),
            source,
        })?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Registration connection closed: {e}");
        }
    });

    let body = serde_json::to_vec(request)?;
    let req = Request::post("/v1beta1/register")
        .header(HOST, "localhost")
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))?;

    let resp = sender.send_request(req).await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.into_body().collect().await?.to_bytes();
        return Err(RegistrationError::Rejected {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    info!(
        resource = %request.resource_name,
        endpoint = %request.endpoint,
        "Registered with kubelet"
    );
    Ok(())
}
