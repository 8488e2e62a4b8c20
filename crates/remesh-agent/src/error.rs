//! On-call agent error types.

use thiserror::Error;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors surfaced by the on-call agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid policy: {0}")]
    PolicyParse(#[from] toml::de::Error),

    #[error("control plane call failed: {0}")]
    ControlPlane(String),

    #[error("remediation for {fingerprint} escalated after {attempts} attempts")]
    Escalated { fingerprint: String, attempts: u32 },
}
