//! Error types for the Remesh registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur while mutating the instance registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("address pool exhausted: no free port in {base}-{max}")]
    AddressPoolExhausted { base: u16, max: u16 },

    #[error("address already in use by a live instance: {0}")]
    AddressInUse(String),

    #[error("duplicate instance id: {0}")]
    DuplicateInstance(String),

    #[error("instance not found: {0}")]
    NotFound(String),
}
