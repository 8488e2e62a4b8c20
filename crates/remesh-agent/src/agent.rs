//! On-call agent — ties alerts, policy, and the control plane together.
//!
//! One `RemediationRecord` per alert fingerprint, each behind its own
//! mutex: deliveries for different fingerprints remediate concurrently
//! while duplicate deliveries for the same fingerprint serialize and
//! collapse into a single action.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use remesh_registry::InstanceStatus;

use crate::alert::AlertEvent;
use crate::control::ControlPlane;
use crate::machine::{
    action_escalated, action_succeeded, cooldown_elapsed, on_alert, Effect, Phase,
    RemediationRecord,
};
use crate::policy::{PolicyConfig, RemediationAction};

/// Monotonic counters exposed on `/metrics`.
#[derive(Debug, Default)]
pub struct AgentStats {
    pub alerts_received: AtomicU64,
    pub actions_issued: AtomicU64,
    pub escalations: AtomicU64,
}

type RecordMap = HashMap<String, Arc<Mutex<RemediationRecord>>>;

/// The on-call agent. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct OnCallAgent {
    policy: Arc<PolicyConfig>,
    control: Arc<dyn ControlPlane>,
    records: Arc<Mutex<RecordMap>>,
    stats: Arc<AgentStats>,
}

impl OnCallAgent {
    pub fn new(policy: PolicyConfig, control: Arc<dyn ControlPlane>) -> Self {
        Self {
            policy: Arc::new(policy),
            control,
            records: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(AgentStats::default()),
        }
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Process one alert delivery end to end.
    ///
    /// Webhook handlers spawn this so the sender is acknowledged
    /// without waiting on remediation.
    pub async fn handle_alert(&self, event: AlertEvent, now: u64) {
        self.stats.alerts_received.fetch_add(1, Ordering::Relaxed);

        let (kind, action) = self.policy.classify(&event.alertname);
        let fingerprint = event.fingerprint();

        let record = {
            let mut records = self.records.lock().await;
            records
                .entry(fingerprint.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(RemediationRecord::new(
                        fingerprint.clone(),
                        event.alertname.clone(),
                        kind,
                        now,
                    )))
                })
                .clone()
        };

        // The transition applies under the per-fingerprint lock, so a
        // duplicate delivery observes ActionPending/ActionTaken and
        // collapses. The lock is released before the action runs: a
        // retrying control-plane call must not wedge record listings
        // or the sweeper behind its backoff.
        let (effect, phase) = {
            let mut guard = record.lock().await;
            let effect = on_alert(&mut guard, event.status, action, now);
            (effect, guard.phase)
        };
        match effect {
            Effect::Issue(action) => {
                info!(
                    %fingerprint,
                    alertname = %event.alertname,
                    ?action,
                    "remediation action issued"
                );
                self.execute(&record, action, now).await;
            }
            Effect::Acknowledge => {
                debug!(
                    %fingerprint,
                    alertname = %event.alertname,
                    ?phase,
                    "alert acknowledged without action"
                );
            }
        }
    }

    /// Execute an action with bounded retries; escalate on exhaustion.
    ///
    /// The record lock is taken only to stamp outcomes, never across a
    /// control-plane call or a backoff sleep.
    async fn execute(
        &self,
        record: &Mutex<RemediationRecord>,
        action: RemediationAction,
        now: u64,
    ) {
        let (fingerprint, alertname) = {
            let r = record.lock().await;
            (r.fingerprint.clone(), r.alertname.clone())
        };

        let attempts = self.policy.max_action_attempts;
        for attempt in 0..attempts {
            match self.try_action(action).await {
                Ok(()) => {
                    action_succeeded(&mut *record.lock().await, action, now);
                    self.stats.actions_issued.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    warn!(
                        %fingerprint,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "remediation attempt failed"
                    );
                    if attempt + 1 < attempts {
                        let backoff = self.policy.retry_backoff_secs << attempt.min(16);
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                    }
                }
            }
        }

        let mut r = record.lock().await;
        action_escalated(&mut r, attempts, now);
        if r.phase == Phase::Escalated {
            self.stats.escalations.fetch_add(1, Ordering::Relaxed);
            error!(
                %fingerprint,
                %alertname,
                attempts,
                "remediation escalated for manual intervention"
            );
        } else {
            warn!(%fingerprint, attempts, "attempts exhausted but the alert already resolved");
        }
    }

    /// One attempt at the given action.
    async fn try_action(&self, action: RemediationAction) -> anyhow::Result<()> {
        match action {
            RemediationAction::NoOp => Ok(()),
            RemediationAction::ScaleUp => {
                let live = self.live_count().await?;
                let target = live + self.policy.scale_step;
                let outcome = self.control.scale(target).await?;
                info!(live, target, ?outcome, "scaled up");
                Ok(())
            }
            RemediationAction::VerifyReplacement => {
                let instances = self.control.get_instances().await?;
                let replacing = instances
                    .iter()
                    .any(|v| v.state != InstanceStatus::Healthy);
                if replacing {
                    // The manager's own health loop owns this failure;
                    // a second replacement from here would double up.
                    info!("instance replacement already in progress; standing down");
                } else {
                    info!("pool is fully healthy; instance-down alert is stale");
                }
                Ok(())
            }
        }
    }

    async fn live_count(&self) -> anyhow::Result<u32> {
        let instances = self.control.get_instances().await?;
        Ok(instances
            .iter()
            .filter(|v| v.state.counts_toward_desired())
            .count() as u32)
    }

    /// Retire cooled-down records; optionally give back the scale-up.
    pub async fn sweep(&self, now: u64) {
        let mut retired = Vec::new();
        {
            let mut records = self.records.lock().await;
            let mut keep = HashMap::new();
            for (fingerprint, arc) in records.drain() {
                let record = arc.lock().await;
                if cooldown_elapsed(&record, self.policy.cooldown_secs, now) {
                    info!(%fingerprint, alertname = %record.alertname, "remediation record retired");
                    retired.push(record.clone());
                } else {
                    drop(record);
                    keep.insert(fingerprint, arc);
                }
            }
            *records = keep;
        }

        for record in retired {
            if self.policy.scale_down_after_cooldown
                && record.last_action == Some(RemediationAction::ScaleUp)
            {
                self.scale_back_down(&record).await;
            }
        }
    }

    /// Best-effort hold-down scale-down after a resolved scale-up.
    /// Failure here is logged, never escalated.
    async fn scale_back_down(&self, record: &RemediationRecord) {
        let live = match self.live_count().await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "scale-down skipped: instance list unavailable");
                return;
            }
        };
        let target = live
            .saturating_sub(self.policy.scale_step)
            .max(self.policy.min_replicas);
        if target >= live {
            debug!(live, target, "scale-down skipped at floor");
            return;
        }
        match self.control.scale(target).await {
            Ok(outcome) => info!(
                fingerprint = %record.fingerprint,
                live,
                target,
                ?outcome,
                "scaled back down after cooldown"
            ),
            Err(e) => warn!(error = %e, "scale-down failed; leaving pool as is"),
        }
    }

    /// Snapshot of every live remediation record.
    pub async fn records(&self) -> Vec<RemediationRecord> {
        // Clone the Arcs first so the map lock is free again before
        // any record lock is awaited.
        let arcs: Vec<Arc<Mutex<RemediationRecord>>> = {
            let map = self.records.lock().await;
            map.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            out.push(arc.lock().await.clone());
        }
        out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        out
    }

    /// Count records in a given phase.
    pub async fn count_phase(&self, phase: Phase) -> usize {
        self.records()
            .await
            .iter()
            .filter(|r| r.phase == phase)
            .count()
    }

    /// Periodic cooldown sweep until shutdown.
    pub async fn run_sweeper(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(epoch_secs()).await;
                }
                _ = shutdown.changed() => {
                    info!("sweeper shutting down");
                    break;
                }
            }
        }
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
