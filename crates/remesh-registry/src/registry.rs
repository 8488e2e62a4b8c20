//! InstanceRegistry — the in-memory record of running instances.
//!
//! The registry holds one `InstanceRecord` per instance identity and a
//! generation counter that bumps on every mutation. All writes come
//! from the process manager's single reconciler task; readers take
//! consistent snapshots that never block the writer beyond the copy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::types::{InstanceId, InstanceRecord, InstanceStatus, InstanceView};

/// A consistent point-in-time copy of the registry.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Generation at which this snapshot was taken.
    pub generation: u64,
    pub instances: Vec<InstanceRecord>,
}

impl RegistrySnapshot {
    /// Count instances in a given status.
    pub fn count(&self, status: InstanceStatus) -> usize {
        self.instances.iter().filter(|i| i.status == status).count()
    }

    /// Instances counting toward the desired replica total.
    pub fn live_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.status.counts_toward_desired())
            .count()
    }

    /// Addresses of Healthy instances, ordered by port for stable
    /// routing table generations.
    pub fn healthy_addresses(&self) -> Vec<String> {
        let mut healthy: Vec<&InstanceRecord> = self
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Healthy)
            .collect();
        healthy.sort_by_key(|i| i.port);
        healthy.iter().map(|i| i.address()).collect()
    }

    /// Views in the `GET /instances` wire shape, ordered by port.
    pub fn views(&self) -> Vec<InstanceView> {
        let mut records: Vec<&InstanceRecord> = self.instances.iter().collect();
        records.sort_by_key(|i| i.port);
        records.iter().map(|r| InstanceView::from(*r)).collect()
    }
}

struct Inner {
    records: HashMap<InstanceId, InstanceRecord>,
    generation: u64,
}

/// Thread-safe instance registry with snapshot reads.
///
/// Invariants, enforced on insert:
/// - at most one record per instance identity
/// - no two live records (anything still holding its address) share
///   a `host:port` address
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                records: HashMap::new(),
                generation: 0,
            })),
        }
    }

    /// Insert a new instance record.
    pub fn insert(&self, record: InstanceRecord) -> RegistryResult<()> {
        let mut inner = self.inner.write().expect("registry lock");

        if inner.records.contains_key(&record.id) {
            return Err(RegistryError::DuplicateInstance(record.id.clone()));
        }
        let address = record.address();
        if inner
            .records
            .values()
            .any(|r| r.status.holds_address() && r.address() == address)
        {
            return Err(RegistryError::AddressInUse(address));
        }

        debug!(id = %record.id, %address, "instance registered");
        inner.records.insert(record.id.clone(), record);
        inner.generation += 1;
        Ok(())
    }

    /// Mutate a record in place via the closure. Bumps the generation.
    pub fn update<F>(&self, id: &str, mutate: F) -> RegistryResult<()>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let mut inner = self.inner.write().expect("registry lock");
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        mutate(record);
        inner.generation += 1;
        Ok(())
    }

    /// Remove a record entirely. Returns it so the caller can release
    /// the address back to the pool.
    pub fn evict(&self, id: &str) -> RegistryResult<InstanceRecord> {
        let mut inner = self.inner.write().expect("registry lock");
        let record = inner
            .records
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        inner.generation += 1;
        debug!(%id, "instance evicted");
        Ok(record)
    }

    /// Get a single record by id.
    pub fn get(&self, id: &str) -> Option<InstanceRecord> {
        let inner = self.inner.read().expect("registry lock");
        inner.records.get(id).cloned()
    }

    /// Take a consistent snapshot of all records.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read().expect("registry lock");
        RegistrySnapshot {
            generation: inner.generation,
            instances: inner.records.values().cloned().collect(),
        }
    }

    /// Current generation without copying records.
    pub fn generation(&self) -> u64 {
        let inner = self.inner.read().expect("registry lock");
        inner.generation
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
