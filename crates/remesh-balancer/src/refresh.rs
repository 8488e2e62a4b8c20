//! Routing table refresh — pulls healthy backends from the manager.
//!
//! When the balancer runs in its own process it periodically asks the
//! manager's control API for the instance list and rebuilds its local
//! routing table. A failed pull keeps the last known good table; the
//! mesh degrades to stale routing rather than an empty one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use remesh_registry::{InstanceStatus, InstanceView, RoutingTable, SharedTable};

use crate::picker::BackendPicker;

/// Where the balancer learns about healthy instances.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    /// Addresses of instances currently eligible for traffic.
    async fn healthy_backends(&self) -> anyhow::Result<Vec<String>>;
}

/// Pulls the instance list from the manager's `GET /instances`.
pub struct ControlPlaneSource {
    /// Manager authority, `host:port`.
    endpoint: String,
}

impl ControlPlaneSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

/// Bound on one pull from the manager.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
impl InstanceSource for ControlPlaneSource {
    async fn healthy_backends(&self) -> anyhow::Result<Vec<String>> {
        tokio::time::timeout(FETCH_TIMEOUT, self.fetch())
            .await
            .map_err(|_| anyhow::anyhow!("instance fetch timed out after {FETCH_TIMEOUT:?}"))?
    }
}

impl ControlPlaneSource {
    async fn fetch(&self) -> anyhow::Result<Vec<String>> {
        let stream = tokio::net::TcpStream::connect(&self.endpoint).await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(format!("http://{}/instances", self.endpoint))
            .header("host", &self.endpoint)
            .body(http_body_util::Empty::<bytes::Bytes>::new())?;

        let resp = sender.send_request(req).await?;
        if !resp.status().is_success() {
            anyhow::bail!("manager returned {}", resp.status());
        }
        let body = http_body_util::BodyExt::collect(resp.into_body())
            .await?
            .to_bytes();
        let views: Vec<InstanceView> = serde_json::from_slice(&body)?;

        let mut backends: Vec<String> = views
            .into_iter()
            .filter(|v| v.state == InstanceStatus::Healthy)
            .map(|v| v.address)
            .collect();
        backends.sort();
        Ok(backends)
    }
}

/// One refresh pass. Swaps the table only when the backend set changed.
/// Returns whether a swap happened.
pub async fn refresh_once(
    source: &dyn InstanceSource,
    table: &SharedTable,
    picker: &BackendPicker,
    generation: u64,
) -> anyhow::Result<bool> {
    let backends = source.healthy_backends().await?;

    let current = table.load();
    if current.backends == backends {
        return Ok(false);
    }

    picker.retain(&backends);
    let swapped = table.swap(RoutingTable {
        generation,
        backends: backends.clone(),
    });
    if swapped {
        info!(
            generation,
            backends = backends.len(),
            "routing table refreshed"
        );
    }
    Ok(swapped)
}

/// Periodic refresh loop until shutdown.
pub async fn run_refresher(
    source: Arc<dyn InstanceSource>,
    table: SharedTable,
    picker: Arc<BackendPicker>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut generation = table.load().generation;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                generation += 1;
                match refresh_once(source.as_ref(), &table, &picker, generation).await {
                    Ok(swapped) => {
                        if !swapped {
                            debug!("routing table unchanged");
                        }
                    }
                    Err(e) => {
                        // Keep serving from the last known good table.
                        warn!(error = %e, "routing table refresh failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("refresher shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StaticSource {
        backends: Mutex<Vec<String>>,
    }

    impl StaticSource {
        fn new(addrs: &[&str]) -> Self {
            Self {
                backends: Mutex::new(addrs.iter().map(|s| s.to_string()).collect()),
            }
        }

        fn set(&self, addrs: &[&str]) {
            *self.backends.lock().unwrap() = addrs.iter().map(|s| s.to_string()).collect();
        }
    }

    #[async_trait]
    impl InstanceSource for StaticSource {
        async fn healthy_backends(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.backends.lock().unwrap().clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl InstanceSource for FailingSource {
        async fn healthy_backends(&self) -> anyhow::Result<Vec<String>> {
            anyhow::bail!("manager unreachable")
        }
    }

    #[tokio::test]
    async fn refresh_installs_new_backends() {
        let source = StaticSource::new(&["127.0.0.1:8001", "127.0.0.1:8002"]);
        let table = SharedTable::new();
        let picker = BackendPicker::new(2);

        let swapped = refresh_once(&source, &table, &picker, 1).await.unwrap();
        assert!(swapped);
        assert_eq!(
            table.load().backends,
            vec!["127.0.0.1:8001", "127.0.0.1:8002"]
        );
    }

    #[tokio::test]
    async fn unchanged_set_skips_swap() {
        let source = StaticSource::new(&["127.0.0.1:8001"]);
        let table = SharedTable::new();
        let picker = BackendPicker::new(2);

        assert!(refresh_once(&source, &table, &picker, 1).await.unwrap());
        assert!(!refresh_once(&source, &table, &picker, 2).await.unwrap());
        assert_eq!(table.load().generation, 1);
    }

    #[tokio::test]
    async fn shrinking_set_drops_departed_backend() {
        let source = StaticSource::new(&["127.0.0.1:8001", "127.0.0.1:8002"]);
        let table = SharedTable::new();
        let picker = BackendPicker::new(1);

        refresh_once(&source, &table, &picker, 1).await.unwrap();
        picker.report_error("127.0.0.1:8002");

        source.set(&["127.0.0.1:8001"]);
        refresh_once(&source, &table, &picker, 2).await.unwrap();

        assert_eq!(table.load().backends, vec!["127.0.0.1:8001"]);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_last_known_good() {
        let source = StaticSource::new(&["127.0.0.1:8001"]);
        let table = SharedTable::new();
        let picker = BackendPicker::new(2);
        refresh_once(&source, &table, &picker, 1).await.unwrap();

        let err = refresh_once(&FailingSource, &table, &picker, 2).await;
        assert!(err.is_err());
        assert_eq!(table.load().backends, vec!["127.0.0.1:8001"]);
    }
}
