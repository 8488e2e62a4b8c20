//! Remediation policy — classification and the alert-to-action table.
//!
//! The mapping from alert names to actions is configuration (TOML),
//! but both sides of the table are closed enums: a rule can only name
//! a kind and action the agent already knows how to execute, so new
//! alert types are compile-time additions.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AgentResult;

/// Classified alert type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Sustained elevated error rate on the service.
    HighErrorRate,
    /// A specific instance stopped answering.
    InstanceDown,
    /// Latency above objective.
    HighLatency,
    /// No rule matched the alert name.
    Unknown,
}

/// What the agent does about a classified alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    /// Scale the pool up by the configured step.
    ScaleUp,
    /// Verify the manager is already replacing the instance; act only
    /// as a check, never a second replacement.
    VerifyReplacement,
    /// Acknowledge without touching the control plane.
    NoOp,
}

/// One classification rule: alert name to kind and action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub alertname: String,
    pub kind: AlertKind,
    pub action: RemediationAction,
}

/// Agent policy, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Seconds a resolved alert lingers before its record is retired.
    pub cooldown_secs: u64,
    /// Replicas added per scale-up action.
    pub scale_step: u32,
    /// Control plane call attempts before escalation.
    pub max_action_attempts: u32,
    /// Base backoff between control plane retries.
    pub retry_backoff_secs: u64,
    /// Scale back down by one step when a scale-up's alert resolves
    /// and its cooldown fully elapses.
    pub scale_down_after_cooldown: bool,
    /// Floor for any scale-down the agent issues.
    pub min_replicas: u32,
    pub rules: Vec<PolicyRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            scale_step: 1,
            max_action_attempts: 3,
            retry_backoff_secs: 2,
            scale_down_after_cooldown: true,
            min_replicas: 1,
            rules: vec![
                PolicyRule {
                    alertname: "HighErrorRate".to_string(),
                    kind: AlertKind::HighErrorRate,
                    action: RemediationAction::ScaleUp,
                },
                PolicyRule {
                    alertname: "HighLatency".to_string(),
                    kind: AlertKind::HighLatency,
                    action: RemediationAction::ScaleUp,
                },
                PolicyRule {
                    alertname: "InstanceDown".to_string(),
                    kind: AlertKind::InstanceDown,
                    action: RemediationAction::VerifyReplacement,
                },
            ],
        }
    }
}

impl PolicyConfig {
    /// Parse policy from TOML. Missing fields fall back to defaults.
    pub fn from_toml(input: &str) -> AgentResult<Self> {
        let config: Self = toml::from_str(input)?;
        Ok(config)
    }

    /// Classify an alert name against the rule table.
    pub fn classify(&self, alertname: &str) -> (AlertKind, RemediationAction) {
        for rule in &self.rules {
            if rule.alertname == alertname {
                return (rule.kind, rule.action);
            }
        }
        debug!(alertname, "no policy rule matched");
        (AlertKind::Unknown, RemediationAction::NoOp)
    }
}
