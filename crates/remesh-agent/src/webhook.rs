//! Webhook receiver and the agent's own HTTP surface.
//!
//! `POST /alerts` always answers 200 once the batch is accepted;
//! remediation runs on spawned tasks so a slow or failing control
//! plane never turns into sender-side retry storms.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use remesh_metrics::{labels, write_counter, write_gauge};

use crate::agent::{epoch_secs, OnCallAgent};
use crate::alert::WebhookPayload;
use crate::machine::Phase;

/// Build the agent's router.
pub fn router(agent: OnCallAgent) -> Router {
    Router::new()
        .route("/alerts", post(receive_alerts))
        .route("/remediations", get(list_remediations))
        .route("/healthz", get(healthz))
        .route("/metrics", get(prometheus_metrics))
        .with_state(agent)
}

/// POST /alerts
pub async fn receive_alerts(
    State(agent): State<OnCallAgent>,
    Json(payload): Json<WebhookPayload>,
) -> impl IntoResponse {
    let received = payload.alerts.len();
    let now = epoch_secs();
    for alert in payload.alerts {
        let agent = agent.clone();
        tokio::spawn(async move {
            agent.handle_alert(alert, now).await;
        });
    }
    Json(serde_json::json!({ "received": received }))
}

/// GET /remediations — operator view, escalations included.
pub async fn list_remediations(State(agent): State<OnCallAgent>) -> impl IntoResponse {
    Json(agent.records().await)
}

/// GET /healthz
pub async fn healthz(State(agent): State<OnCallAgent>) -> impl IntoResponse {
    let escalated = agent.count_phase(Phase::Escalated).await;
    Json(serde_json::json!({ "ok": true, "escalated": escalated }))
}

/// GET /metrics
pub async fn prometheus_metrics(State(agent): State<OnCallAgent>) -> impl IntoResponse {
    let stats = agent.stats();
    let mut body = String::new();

    write_counter(
        &mut body,
        "remesh_alerts_received_total",
        "Alert deliveries accepted by the webhook",
        &[(vec![], stats.alerts_received.load(Ordering::Relaxed))],
    );
    write_counter(
        &mut body,
        "remesh_remediations_total",
        "Remediation actions issued",
        &[(vec![], stats.actions_issued.load(Ordering::Relaxed))],
    );
    write_counter(
        &mut body,
        "remesh_escalations_total",
        "Remediations escalated for manual intervention",
        &[(vec![], stats.escalations.load(Ordering::Relaxed))],
    );

    let phases = [
        (Phase::ActionPending, "action_pending"),
        (Phase::ActionTaken, "action_taken"),
        (Phase::CoolingDown, "cooling_down"),
        (Phase::Escalated, "escalated"),
    ];
    let mut series = Vec::new();
    for (phase, label) in phases {
        series.push((labels(&[("phase", label)]), agent.count_phase(phase).await as f64));
    }
    write_gauge(
        &mut body,
        "remesh_remediation_records",
        "Live remediation records per phase",
        &series,
    );

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
