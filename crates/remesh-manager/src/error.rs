//! Process manager error types.

use thiserror::Error;

/// Result type alias for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors surfaced by the process manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("replica count {requested} exceeds the configured maximum {max}")]
    ReplicaCeiling { requested: u32, max: u32 },

    #[error("replica count {requested} exceeds address pool capacity {capacity}")]
    CapacityExceeded { requested: u32, capacity: usize },

    #[error("registry error: {0}")]
    Registry(#[from] remesh_registry::RegistryError),

    #[error("launcher error for instance {id}: {message}")]
    Launcher { id: String, message: String },

    #[error("reconciler unavailable")]
    ReconcilerGone,
}
