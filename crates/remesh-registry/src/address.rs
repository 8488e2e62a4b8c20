//! Bounded address pool for instance allocation.
//!
//! Instances draw `host:port` addresses from a fixed port range.
//! Allocation always picks the smallest free port; a full pool is a
//! capacity error surfaced to the caller, never a panic.

use std::collections::BTreeSet;

use crate::error::{RegistryError, RegistryResult};

/// A bounded pool of `host:port` addresses.
///
/// Owned by the reconciler alongside the registry, so it needs no
/// internal locking — all mutation goes through the single writer.
#[derive(Debug)]
pub struct AddressPool {
    host: String,
    base_port: u16,
    max_port: u16,
    in_use: BTreeSet<u16>,
}

impl AddressPool {
    /// Create a pool over `base_port..=max_port` on the given host.
    pub fn new(host: impl Into<String>, base_port: u16, max_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
            max_port,
            in_use: BTreeSet::new(),
        }
    }

    /// Allocate the smallest free port. Errors when the range is full.
    pub fn allocate(&mut self) -> RegistryResult<(String, u16)> {
        for port in self.base_port..=self.max_port {
            if !self.in_use.contains(&port) {
                self.in_use.insert(port);
                return Ok((self.host.clone(), port));
            }
        }
        Err(RegistryError::AddressPoolExhausted {
            base: self.base_port,
            max: self.max_port,
        })
    }

    /// Return a port to the pool. Unknown ports are ignored.
    pub fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }

    /// Total number of addresses in the range.
    pub fn capacity(&self) -> usize {
        (self.max_port - self.base_port) as usize + 1
    }

    /// Number of addresses currently free.
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_smallest_free_port_first() {
        let mut pool = AddressPool::new("127.0.0.1", 8001, 8003);

        assert_eq!(pool.allocate().unwrap(), ("127.0.0.1".to_string(), 8001));
        assert_eq!(pool.allocate().unwrap(), ("127.0.0.1".to_string(), 8002));
        assert_eq!(pool.allocate().unwrap(), ("127.0.0.1".to_string(), 8003));
    }

    #[test]
    fn exhaustion_is_a_capacity_error() {
        let mut pool = AddressPool::new("127.0.0.1", 8001, 8002);
        pool.allocate().unwrap();
        pool.allocate().unwrap();

        let err = pool.allocate().unwrap_err();
        assert!(matches!(
            err,
            RegistryError::AddressPoolExhausted { base: 8001, max: 8002 }
        ));
    }

    #[test]
    fn released_port_is_reused() {
        let mut pool = AddressPool::new("127.0.0.1", 8001, 8002);
        pool.allocate().unwrap();
        pool.allocate().unwrap();

        pool.release(8001);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.allocate().unwrap().1, 8001);
    }

    #[test]
    fn release_of_unknown_port_is_a_no_op() {
        let mut pool = AddressPool::new("127.0.0.1", 8001, 8005);
        pool.release(9999);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn capacity_counts_inclusive_range() {
        let pool = AddressPool::new("127.0.0.1", 8001, 8010);
        assert_eq!(pool.capacity(), 10);
    }

    #[test]
    fn single_port_pool() {
        let mut pool = AddressPool::new("127.0.0.1", 9000, 9000);
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.allocate().unwrap().1, 9000);
        assert!(pool.allocate().is_err());
    }
}
