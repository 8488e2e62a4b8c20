//! Balancer HTTP surface.
//!
//! `/healthz` and `/metrics` belong to the balancer itself; every
//! other path falls through to the proxy dispatcher.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use remesh_metrics::{render_request_metrics, write_gauge};

use crate::dispatch::{proxy, ProxyState};

/// Build the balancer router: own endpoints first, proxy fallback.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(prometheus_metrics))
        .fallback(proxy)
        .with_state(state)
}

/// GET /healthz
pub async fn healthz(State(state): State<ProxyState>) -> impl IntoResponse {
    let table = state.table.load();
    Json(serde_json::json!({
        "ok": true,
        "backends": table.len(),
        "generation": table.generation,
    }))
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ProxyState>) -> impl IntoResponse {
    let samples = state.metrics.samples().await;
    let mut body = render_request_metrics(&samples);

    let table = state.table.load();
    write_gauge(
        &mut body,
        "remesh_routing_backends",
        "Backends in the active routing table",
        &[(vec![], table.len() as f64)],
    );
    write_gauge(
        &mut body,
        "remesh_routing_generation",
        "Generation of the active routing table",
        &[(vec![], table.generation as f64)],
    );

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::BackendPicker;
    use remesh_metrics::RequestMetrics;
    use remesh_registry::{RoutingTable, SharedTable};
    use std::sync::Arc;

    fn test_state() -> ProxyState {
        let table = SharedTable::new();
        table.swap(RoutingTable {
            generation: 3,
            backends: vec!["127.0.0.1:8001".to_string()],
        });
        ProxyState::new(table, Arc::new(BackendPicker::new(2)), RequestMetrics::new())
    }

    #[tokio::test]
    async fn healthz_reports_backend_count() {
        let resp = healthz(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["backends"], 1);
        assert_eq!(json["generation"], 3);
    }

    #[tokio::test]
    async fn metrics_endpoint_includes_table_gauges() {
        let state = test_state();
        state.metrics.record("127.0.0.1:8001", "/items", 2000, false).await;

        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("remesh_requests_total"));
        assert!(text.contains("remesh_routing_backends 1"));
        assert!(text.contains("remesh_routing_generation 3"));
    }
}
