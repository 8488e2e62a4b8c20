//! Per-fingerprint remediation state machine.
//!
//! Transitions are pure functions over a `RemediationRecord`; the
//! agent applies them under a per-fingerprint lock and performs the
//! returned effect. Keeping the transition logic free of I/O makes
//! the no-duplicate-action invariant directly testable.
//!
//! ```text
//!   Idle ──Firing──▶ ActionPending ──issued──▶ ActionTaken
//!                        │  ▲                     │   │
//!               Resolved │  │ Firing      Firing──┘   │ Resolved
//!                        ▼  │ (re-arm)    (dedup)     ▼
//!                      CoolingDown ◀──────────────────┘
//!                        │
//!                        └──cooldown elapsed──▶ retired
//! ```
//!
//! Action failures push a record into `Escalated`, which only an
//! operator resolves; further deliveries are acknowledged unchanged.

use serde::{Deserialize, Serialize};

use crate::alert::AlertStatus;
use crate::policy::{AlertKind, RemediationAction};

/// Phase of a fingerprint's remediation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ActionPending,
    ActionTaken,
    CoolingDown,
    /// Remediation retries exhausted; requires manual intervention.
    Escalated,
}

/// Remediation state for one alert fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub fingerprint: String,
    pub alertname: String,
    pub kind: AlertKind,
    pub phase: Phase,
    pub last_action: Option<RemediationAction>,
    pub last_action_at: u64,
    pub retry_count: u32,
    /// When the alert resolved (0 while still firing).
    pub resolved_at: u64,
    pub updated_at: u64,
}

impl RemediationRecord {
    pub fn new(fingerprint: String, alertname: String, kind: AlertKind, now: u64) -> Self {
        Self {
            fingerprint,
            alertname,
            kind,
            phase: Phase::Idle,
            last_action: None,
            last_action_at: 0,
            retry_count: 0,
            resolved_at: 0,
            updated_at: now,
        }
    }
}

/// Effect the agent must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Issue the remediation action for this fingerprint.
    Issue(RemediationAction),
    /// Duplicate or uninteresting delivery; acknowledge only.
    Acknowledge,
}

/// Apply one alert delivery to a record.
pub fn on_alert(
    record: &mut RemediationRecord,
    status: AlertStatus,
    action: RemediationAction,
    now: u64,
) -> Effect {
    record.updated_at = now;
    match (record.phase, status) {
        (Phase::Idle, AlertStatus::Firing) => {
            record.phase = Phase::ActionPending;
            record.resolved_at = 0;
            Effect::Issue(action)
        }
        // Re-arm: the alert came back before the record retired.
        (Phase::CoolingDown, AlertStatus::Firing) => {
            record.phase = Phase::ActionPending;
            record.resolved_at = 0;
            record.retry_count = 0;
            Effect::Issue(action)
        }
        // Duplicate deliveries while an action is pending or taken.
        (Phase::ActionPending, AlertStatus::Firing)
        | (Phase::ActionTaken, AlertStatus::Firing) => Effect::Acknowledge,

        (Phase::ActionPending, AlertStatus::Resolved)
        | (Phase::ActionTaken, AlertStatus::Resolved) => {
            record.phase = Phase::CoolingDown;
            record.resolved_at = now;
            Effect::Acknowledge
        }
        // Resolved with nothing outstanding, or anything at all after
        // escalation: acknowledged, never automated.
        (Phase::Idle, AlertStatus::Resolved)
        | (Phase::CoolingDown, AlertStatus::Resolved)
        | (Phase::Escalated, _) => Effect::Acknowledge,
    }
}

/// Record that the issued action completed. A Resolved delivery that
/// landed while the action was in flight has already moved the record
/// to CoolingDown; only the action metadata is stamped then.
pub fn action_succeeded(record: &mut RemediationRecord, action: RemediationAction, now: u64) {
    record.last_action = Some(action);
    record.last_action_at = now;
    record.retry_count = 0;
    record.updated_at = now;
    if record.phase == Phase::ActionPending {
        record.phase = Phase::ActionTaken;
    }
}

/// Record that the action failed after `attempts` tries. A record
/// whose alert resolved mid-flight cools down instead of escalating.
pub fn action_escalated(record: &mut RemediationRecord, attempts: u32, now: u64) {
    record.retry_count = attempts;
    record.updated_at = now;
    if record.phase == Phase::ActionPending {
        record.phase = Phase::Escalated;
    }
}

/// Whether a cooled-down record is due for retirement.
pub fn cooldown_elapsed(record: &RemediationRecord, cooldown_secs: u64, now: u64) -> bool {
    record.phase == Phase::CoolingDown && now >= record.resolved_at + cooldown_secs
}
