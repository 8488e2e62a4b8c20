//! Health probe logic.
//!
//! HTTP probes against instance health endpoints with a bounded
//! timeout, plus the backoff schedule used between respawn attempts
//! for an identity that keeps failing.

use std::time::Duration;

use tracing::debug;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The health endpoint returned 2xx within the timeout.
    Pass,
    /// Non-2xx response, connection failure, or timeout.
    Fail,
}

/// Exponential backoff before the `respawn_count`-th respawn attempt.
///
/// `base * 2^respawn_count`, capped at `max`. The first respawn
/// (count 0) waits `base`.
pub fn respawn_backoff(base: Duration, max: Duration, respawn_count: u32) -> Duration {
    let shift = respawn_count.min(16);
    base.saturating_mul(1u32 << shift).min(max)
}

/// Perform an HTTP health probe against `host:port`.
///
/// Returns `Pass` only for a 2xx response received within `timeout`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeOutcome {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeOutcome::Fail;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeOutcome::Fail;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "remesh-manager/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(_) => return ProbeOutcome::Fail,
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Pass,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeOutcome::Fail
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeOutcome::Fail
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeOutcome::Fail
        }
    }
}
