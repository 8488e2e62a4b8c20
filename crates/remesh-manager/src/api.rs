//! Control API handlers for the process manager.
//!
//! `GET /instances` and `POST /scale` are the public contract used by
//! operators and the on-call agent; `/healthz` and `/metrics` serve
//! liveness and Prometheus exposition.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use remesh_metrics::write_gauge;
use remesh_registry::{InstanceStatus, ScaleRequest};

use crate::error::ManagerError;
use crate::reconciler::ManagerHandle;

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": msg })))
}

/// Build the control API router.
pub fn router(handle: ManagerHandle) -> Router {
    Router::new()
        .route("/instances", get(list_instances))
        .route("/scale", post(scale))
        .route("/healthz", get(healthz))
        .route("/metrics", get(prometheus_metrics))
        .with_state(handle)
}

/// GET /instances
pub async fn list_instances(State(handle): State<ManagerHandle>) -> impl IntoResponse {
    Json(handle.get_instances())
}

/// POST /scale
pub async fn scale(
    State(handle): State<ManagerHandle>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    match handle.scale(req.replicas).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e @ ManagerError::ReplicaCeiling { .. }) => {
            error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response()
        }
        Err(e @ ManagerError::CapacityExceeded { .. }) => {
            error_response(&e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(e) => {
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

/// GET /healthz
pub async fn healthz(State(handle): State<ManagerHandle>) -> impl IntoResponse {
    let count = handle.snapshot().count(InstanceStatus::Healthy);
    Json(serde_json::json!({ "ok": true, "healthy_instances": count }))
}

/// GET /metrics
pub async fn prometheus_metrics(State(handle): State<ManagerHandle>) -> impl IntoResponse {
    let snap = handle.snapshot();
    let states = [
        (InstanceStatus::Starting, "starting"),
        (InstanceStatus::Healthy, "healthy"),
        (InstanceStatus::Unhealthy, "unhealthy"),
        (InstanceStatus::Draining, "draining"),
        (InstanceStatus::Failed, "failed"),
    ];
    let series: Vec<(Vec<(String, String)>, f64)> = states
        .iter()
        .map(|(status, label)| {
            (
                vec![("state".to_string(), label.to_string())],
                snap.count(*status) as f64,
            )
        })
        .collect();

    let mut body = String::new();
    write_gauge(
        &mut body,
        "remesh_instances",
        "Instances per lifecycle state",
        &series,
    );
    write_gauge(
        &mut body,
        "remesh_registry_generation",
        "Registry mutation counter",
        &[(vec![], snap.generation as f64)],
    );
    write_gauge(
        &mut body,
        "remesh_routing_backends",
        "Backends in the active routing table",
        &[(vec![], handle.routing_table().len() as f64)],
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
    use crate::launcher::NullLauncher;
    use crate::reconciler::{ManagerConfig, Reconciler};
    use std::sync::Arc;
    use tokio::sync::watch;

    fn test_state() -> ManagerHandle {
        let cfg = ManagerConfig {
            max_replicas: 4,
            initial_replicas: 0,
            base_port: 8001,
            max_port: 8003,
            ..ManagerConfig::default()
        };
        let (rec, handle) = Reconciler::new(cfg, Arc::new(NullLauncher));
        let (tx, rx) = watch::channel(false);
        // Leak the shutdown sender so the actor runs for the test's
        // lifetime.
        std::mem::forget(tx);
        tokio::spawn(rec.run(rx));
        handle
    }

    #[tokio::test]
    async fn list_instances_empty() {
        let handle = test_state();
        let resp = list_instances(State(handle)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scale_accepts_valid_target() {
        let handle = test_state();
        let resp = scale(State(handle.clone()), Json(ScaleRequest { replicas: 2 }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(handle.get_instances().len(), 2);
    }

    #[tokio::test]
    async fn scale_above_max_is_bad_request() {
        let handle = test_state();
        let resp = scale(State(handle), Json(ScaleRequest { replicas: 99 }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn scale_beyond_capacity_is_conflict() {
        // max_replicas 4 but only 3 ports in the pool.
        let handle = test_state();
        let resp = scale(State(handle), Json(ScaleRequest { replicas: 4 }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let handle = test_state();
        let resp = healthz(State(handle)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let handle = test_state();
        let resp = prometheus_metrics(State(handle)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
