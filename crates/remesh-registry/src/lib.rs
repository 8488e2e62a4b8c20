//! remesh-registry — in-memory instance registry for Remesh.
//!
//! The leaf crate of the control plane: instance records and their
//! lifecycle states, the single-writer registry with snapshot reads,
//! the bounded address pool, and the atomically-swapped routing table.
//!
//! # Architecture
//!
//! ```text
//! InstanceRegistry (one writer: the reconciler)
//!   ├── InstanceRecord per identity, generation counter
//!   └── snapshot() → RegistrySnapshot (consistent copy)
//!
//! AddressPool — smallest-free-port allocation over a bounded range
//!
//! SharedTable — Arc-swapped RoutingTable of Healthy addresses;
//!               readers always see one complete generation
//! ```

pub mod address;
pub mod error;
pub mod registry;
pub mod table;
pub mod types;

pub use address::AddressPool;
pub use error::{RegistryError, RegistryResult};
pub use registry::{InstanceRegistry, RegistrySnapshot};
pub use table::{RoutingTable, SharedTable};
pub use types::*;
