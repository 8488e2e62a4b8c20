//! remesh-metrics — observability for Remesh components.
//!
//! Tracks request outcomes partitioned by backend address and route,
//! and renders Prometheus-compatible text exposition for the
//! `/metrics` endpoint every component exposes.
//!
//! ```text
//! RequestMetrics
//!   ├── record() ← called per dispatched request
//!   └── samples() → Vec<RequestSample> for exposition
//!
//! prometheus
//!   ├── render_request_metrics() → text/plain body
//!   └── write_gauge() / write_counter() → ad-hoc component series
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{RequestMetrics, RequestSample};
pub use prometheus::{labels, render_request_metrics, write_counter, write_gauge};
