//! Backend selection — round-robin with error deprioritization.
//!
//! An atomic counter rotates the starting position across requests.
//! Backends that recently failed at the transport level are moved to
//! the back of each attempt plan until they answer again, so a flapping
//! instance stops eating first attempts without being removed from
//! rotation entirely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use tracing::debug;

/// Round-robin backend picker with per-address error tracking.
///
/// Lock-free on the rotation counter; the error map takes a short
/// read/write lock per report.
pub struct BackendPicker {
    counter: AtomicUsize,
    /// Consecutive transport errors at or above this count deprioritize
    /// an address.
    penalty_threshold: u32,
    errors: RwLock<HashMap<String, u32>>,
}

impl BackendPicker {
    pub fn new(penalty_threshold: u32) -> Self {
        Self {
            counter: AtomicUsize::new(0),
            penalty_threshold,
            errors: RwLock::new(HashMap::new()),
        }
    }

    /// Record a transport-level failure against an address.
    pub fn report_error(&self, backend: &str) {
        let mut errors = self.errors.write().expect("picker lock");
        let count = errors.entry(backend.to_string()).or_insert(0);
        *count += 1;
        debug!(backend, consecutive = *count, "backend transport error");
    }

    /// Record a successful response; the address rejoins full rotation.
    pub fn report_success(&self, backend: &str) {
        let mut errors = self.errors.write().expect("picker lock");
        errors.remove(backend);
    }

    /// Drop error state for addresses no longer in the table.
    pub fn retain(&self, backends: &[String]) {
        let mut errors = self.errors.write().expect("picker lock");
        errors.retain(|addr, _| backends.iter().any(|b| b == addr));
    }

    fn is_penalized(&self, backend: &str) -> bool {
        let errors = self.errors.read().expect("picker lock");
        errors
            .get(backend)
            .is_some_and(|count| *count >= self.penalty_threshold)
    }

    /// Build an attempt plan over distinct backends.
    ///
    /// The plan starts at the next round-robin position and keeps
    /// rotation order, except that penalized addresses sink to the end.
    /// At most `attempts` addresses are returned, each exactly once.
    pub fn plan(&self, backends: &[String], attempts: usize) -> Vec<String> {
        if backends.is_empty() || attempts == 0 {
            return Vec::new();
        }
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % backends.len();

        let mut clean = Vec::new();
        let mut penalized = Vec::new();
        for i in 0..backends.len() {
            let backend = &backends[(start + i) % backends.len()];
            if self.is_penalized(backend) {
                penalized.push(backend.clone());
            } else {
                clean.push(backend.clone());
            }
        }
        clean.extend(penalized);
        clean.truncate(attempts);
        clean
    }
}
