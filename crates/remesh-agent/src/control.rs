//! Control plane client — how the agent talks to the process manager.
//!
//! A trait seam so the remediation logic can be exercised against a
//! recording fake; the production implementation speaks the manager's
//! HTTP control API.

use async_trait::async_trait;
use http_body_util::BodyExt;
use tracing::debug;

use remesh_registry::{InstanceView, ScaleOutcome, ScaleRequest};

/// Bound on any single manager call.
const CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Operations the agent needs from the process manager.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_instances(&self) -> anyhow::Result<Vec<InstanceView>>;
    async fn scale(&self, replicas: u32) -> anyhow::Result<ScaleOutcome>;
}

/// HTTP client for the manager's control API.
pub struct HttpControlPlane {
    /// Manager authority, `host:port`.
    endpoint: String,
}

impl HttpControlPlane {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<(http::StatusCode, bytes::Bytes)> {
        tokio::time::timeout(CALL_TIMEOUT, self.request_inner(method, path, body))
            .await
            .map_err(|_| anyhow::anyhow!("control plane call timed out after {CALL_TIMEOUT:?}"))?
    }

    async fn request_inner(
        &self,
        method: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<(http::StatusCode, bytes::Bytes)> {
        let stream = tokio::net::TcpStream::connect(&self.endpoint).await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.endpoint, path))
            .header("host", &self.endpoint);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder.body(http_body_util::Full::new(bytes::Bytes::from(
            body.unwrap_or_default(),
        )))?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        debug!(%status, path, "control plane response");
        Ok((status, bytes))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_instances(&self) -> anyhow::Result<Vec<InstanceView>> {
        let (status, body) = self.request("GET", "/instances", None).await?;
        if !status.is_success() {
            anyhow::bail!("GET /instances returned {status}");
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn scale(&self, replicas: u32) -> anyhow::Result<ScaleOutcome> {
        let payload = serde_json::to_vec(&ScaleRequest { replicas })?;
        let (status, body) = self.request("POST", "/scale", Some(payload)).await?;
        if !status.is_success() {
            anyhow::bail!(
                "POST /scale returned {status}: {}",
                String::from_utf8_lossy(&body)
            );
        }
        Ok(serde_json::from_slice(&body)?)
    }
}
