//! Remesh on-call agent.
//!
//! Consumes alert webhooks, deduplicates deliveries by fingerprint,
//! and drives a per-fingerprint remediation state machine that issues
//! scale commands back into the process manager.
//!
//! ```text
//!   alert router ──POST /alerts──▶ webhook ──▶ per-fingerprint
//!                                               state machine
//!                                                    │
//!                                           policy table lookup
//!                                                    │
//!                                                    ▼
//!                                   manager control API (Scale,
//!                                   GetInstances), bounded retries,
//!                                   escalation on exhaustion
//! ```

pub mod agent;
pub mod alert;
pub mod control;
pub mod error;
pub mod machine;
pub mod policy;
pub mod webhook;

pub use agent::{AgentStats, OnCallAgent};
pub use alert::{AlertEvent, AlertStatus, WebhookPayload};
pub use control::{ControlPlane, HttpControlPlane};
pub use error::{AgentError, AgentResult};
pub use machine::{Phase, RemediationRecord};
pub use policy::{AlertKind, PolicyConfig, PolicyRule, RemediationAction};
pub use webhook::router;
