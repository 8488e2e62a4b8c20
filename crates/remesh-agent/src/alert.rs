//! Alert events and fingerprinting.
//!
//! The webhook receives batched alert payloads from an external alert
//! router. Delivery is at-least-once: the same logical alert arrives
//! repeatedly, so everything downstream keys on a fingerprint derived
//! from the alert name and its label set rather than on deliveries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Whether an alert is currently firing or has resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// A single alert as delivered by the alert router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alertname: String,
    /// BTreeMap keeps label iteration order stable for fingerprinting.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub status: AlertStatus,
    #[serde(rename = "startsAt", default)]
    pub starts_at: String,
}

impl AlertEvent {
    /// Stable identity of the logical alert: a hex SHA-256 over the
    /// alert name and the sorted label set. Independent of status and
    /// delivery count.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.alertname.as_bytes());
        for (key, value) in &self.labels {
            hasher.update(b"\x1f");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Batched webhook body: `{"alerts": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub alerts: Vec<AlertEvent>,
}
