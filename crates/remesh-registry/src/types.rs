//! Domain types for the Remesh instance registry.
//!
//! These types describe the control plane's view of the item-catalog
//! pool: instance records owned by the process manager, and the
//! read-only views handed to everyone else.

use serde::{Deserialize, Serialize};

/// Unique identifier for a service instance.
pub type InstanceId = String;

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Launched but not yet confirmed healthy.
    Starting,
    /// Passing health checks and eligible for traffic.
    Healthy,
    /// Failed the consecutive-failure threshold; pending replacement.
    Unhealthy,
    /// Removed from traffic; in-flight work finishing before teardown.
    Draining,
    /// Torn down; about to be evicted from the registry.
    Stopped,
    /// Respawn budget exhausted; requires operator intervention.
    Failed,
}

impl InstanceStatus {
    /// Whether this instance counts toward the desired replica total.
    ///
    /// Starting and Healthy instances are "live capacity"; everything
    /// else is on its way out or already gone.
    pub fn counts_toward_desired(self) -> bool {
        matches!(self, InstanceStatus::Starting | InstanceStatus::Healthy)
    }

    /// Whether this instance still holds its network address.
    pub fn holds_address(self) -> bool {
        !matches!(self, InstanceStatus::Stopped | InstanceStatus::Failed)
    }
}

/// Full record for a single instance. Owned exclusively by the process
/// manager's reconciler; other components only ever see snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    /// Consecutive health probe failures.
    pub consecutive_failures: u32,
    /// How many times this identity has been respawned after failure.
    pub respawn_count: u32,
    /// Unix timestamp of the last health probe (0 = never probed).
    pub last_probe_at: u64,
    /// Unix timestamp when this instance was launched.
    pub started_at: u64,
    /// Unix timestamp of the last status change.
    pub updated_at: u64,
}

impl InstanceRecord {
    /// The dialable `host:port` address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read-only instance view returned by `GET /instances`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceView {
    pub id: InstanceId,
    pub address: String,
    pub state: InstanceStatus,
}

impl From<&InstanceRecord> for InstanceView {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            id: record.id.clone(),
            address: record.address(),
            state: record.status,
        }
    }
}

// ── Scale ─────────────────────────────────────────────────────────

/// Body of `POST /scale`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// Target number of healthy replicas.
    pub replicas: u32,
}

/// Outcome of a scale request, reported synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScaleOutcome {
    /// Desired count updated; convergence happens asynchronously.
    Accepted { replicas: u32 },
    /// Target equals the current desired count. Idempotent no-op.
    AcceptedNoOp { replicas: u32 },
}
