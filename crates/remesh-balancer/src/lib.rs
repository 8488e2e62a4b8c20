//! Remesh load balancer.
//!
//! Fronts the item-catalog instance pool: keeps a local routing table
//! of healthy backends, spreads requests round-robin, retries
//! transport failures across distinct backends, and exposes request
//! metrics.
//!
//! ```text
//!   client ──▶ proxy fallback ──▶ picker ──▶ backend
//!                   │                ▲
//!                   ▼                │ deprioritize on error
//!             RequestMetrics    SharedTable ◀── refresher ◀── manager
//! ```
//!
//! The routing table is swapped atomically; requests in flight keep
//! the table they started with.

pub mod dispatch;
pub mod picker;
pub mod refresh;
pub mod server;

pub use dispatch::ProxyState;
pub use picker::BackendPicker;
pub use refresh::{run_refresher, ControlPlaneSource, InstanceSource};
pub use server::router;
