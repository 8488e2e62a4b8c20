//! Routing table — the read-optimized view of dispatchable backends.
//!
//! The table is derived from the registry's Healthy instances and is
//! always replaced wholesale: readers grab an `Arc` to the current
//! table and keep a complete, single-generation view for as long as
//! they hold it. There is no in-place patching.

use std::sync::{Arc, RwLock};

use tracing::debug;

/// An immutable routing table generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    /// Registry generation this table was built from.
    pub generation: u64,
    /// Ordered backend addresses (`host:port`), Healthy instances only.
    pub backends: Vec<String>,
}

impl RoutingTable {
    /// An empty table at generation zero.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            backends: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }
}

/// Shared handle over the current routing table.
///
/// `load()` is a cheap `Arc` clone; `swap()` atomically replaces the
/// whole table. Swaps are monotonic: a table older than the current
/// generation is ignored, so a slow rebuild can never roll the view
/// backwards.
#[derive(Clone)]
pub struct SharedTable {
    current: Arc<RwLock<Arc<RoutingTable>>>,
}

impl SharedTable {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(RoutingTable::empty()))),
        }
    }

    /// The current table. The returned `Arc` stays valid and complete
    /// even if the table is swapped immediately afterwards.
    pub fn load(&self) -> Arc<RoutingTable> {
        self.current.read().expect("table lock").clone()
    }

    /// Replace the table if `table` is at least as new as the current
    /// generation. Returns whether the swap happened.
    pub fn swap(&self, table: RoutingTable) -> bool {
        let mut current = self.current.write().expect("table lock");
        if table.generation < current.generation {
            debug!(
                incoming = table.generation,
                current = current.generation,
                "stale routing table rejected"
            );
            return false;
        }
        debug!(
            generation = table.generation,
            backends = table.backends.len(),
            "routing table swapped"
        );
        *current = Arc::new(table);
        true
    }
}

impl Default for SharedTable {
    fn default() -> Self {
        Self::new()
    }
}
