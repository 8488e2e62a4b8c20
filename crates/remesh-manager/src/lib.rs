//! Remesh process manager.
//!
//! Owns the instance pool for the item-catalog service: launches
//! instances, health-checks them, replaces the ones that fail, drains
//! surplus on scale-down, and publishes the routing table the load
//! balancer reads.
//!
//! ```text
//!   POST /scale ──┐
//!                 ▼
//!         ┌──────────────┐  probe reports   ┌──────────┐
//!         │  Reconciler   │◀────────────────│  Prober  │
//!         │ (single writer│                 └──────────┘
//!         │  command loop)│
//!         └──────┬───────┘
//!                │ swap
//!                ▼
//!         SharedTable ──▶ load balancer
//! ```
//!
//! All registry mutations flow through the reconciler's command queue;
//! `GET /instances` reads snapshots and never waits on it.

pub mod api;
pub mod error;
pub mod launcher;
pub mod probe;
pub mod reconciler;

pub use error::{ManagerError, ManagerResult};
pub use launcher::{CommandLauncher, InstanceLauncher, NullLauncher};
pub use probe::{http_probe, respawn_backoff, ProbeOutcome};
pub use reconciler::{Command, ManagerConfig, ManagerHandle, Reconciler};
