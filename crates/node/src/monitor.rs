//! Allocated-disk accounting.
//!
//! The operator allocates a byte budget; every committed piece charges its
//! satellite's partition and the shared total, every delete refunds it. The
//! totals are a cache over the blob store, rebuilt by `recalculate` at
//! startup, and are adjusted inside the piece store's commit/delete critical
//! sections so they never drift from the directory contents while running.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use orbit_common::error::{Error, Result};
use orbit_common::id::NodeId;
use orbit_storage::BlobStore;

#[derive(Debug, Default)]
struct Usage {
    total: u64,
    per_satellite: HashMap<NodeId, u64>,
}

#[derive(Debug)]
pub struct CapacityMonitor {
    allocated: u64,
    usage: RwLock<Usage>,
}

impl CapacityMonitor {
    #[must_use]
    pub fn new(allocated: u64) -> Self {
        CapacityMonitor {
            allocated,
            usage: RwLock::new(Usage::default()),
        }
    }

    /// Rebuild the cache by walking the blob store for each satellite.
    pub fn recalculate(&self, blobs: &dyn BlobStore, satellites: &[NodeId]) -> Result<()> {
        let mut usage = Usage::default();
        for satellite in satellites {
            let used: u64 = blobs
                .list(satellite.as_bytes())?
                .iter()
                .map(|info| info.size)
                .sum();
            usage.total += used;
            usage.per_satellite.insert(*satellite, used);
        }
        info!(total = usage.total, allocated = self.allocated, "space usage recalculated");
        *self.usage.write() = usage;
        Ok(())
    }

    /// Fail if adding `incoming` bytes would exceed the allocation.
    pub fn check_available(&self, incoming: u64) -> Result<()> {
        let used = self.usage.read().total;
        if used.saturating_add(incoming) > self.allocated {
            return Err(Error::resource_exhausted(format!(
                "storage full: used {} + incoming {} > allocated {}",
                used, incoming, self.allocated
            )));
        }
        Ok(())
    }

    pub fn add(&self, satellite: NodeId, bytes: u64) {
        let mut usage = self.usage.write();
        usage.total = usage.total.saturating_add(bytes);
        *usage.per_satellite.entry(satellite).or_insert(0) += bytes;
    }

    pub fn sub(&self, satellite: NodeId, bytes: u64) {
        let mut usage = self.usage.write();
        usage.total = usage.total.saturating_sub(bytes);
        if let Some(entry) = usage.per_satellite.get_mut(&satellite) {
            *entry = entry.saturating_sub(bytes);
        }
    }

    #[must_use]
    pub fn used_total(&self) -> u64 {
        self.usage.read().total
    }

    #[must_use]
    pub fn used_for(&self, satellite: &NodeId) -> u64 {
        self.usage.read().per_satellite.get(satellite).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    #[must_use]
    pub fn available(&self) -> u64 {
        self.allocated.saturating_sub(self.used_total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId::from_public_key_bytes(&[b; 32])
    }

    #[test]
    fn test_accounting_add_sub() {
        let monitor = CapacityMonitor::new(1000);
        monitor.add(node(1), 400);
        monitor.add(node(2), 100);
        assert_eq!(monitor.used_total(), 500);
        assert_eq!(monitor.used_for(&node(1)), 400);
        assert_eq!(monitor.available(), 500);

        monitor.sub(node(1), 150);
        assert_eq!(monitor.used_for(&node(1)), 250);
        assert_eq!(monitor.used_total(), 350);
    }

    #[test]
    fn test_check_available_enforces_allocation() {
        let monitor = CapacityMonitor::new(100);
        monitor.check_available(100).expect("fits exactly");
        monitor.add(node(1), 60);
        monitor.check_available(40).expect("fits");
        let err = monitor.check_available(41).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn test_sub_never_underflows() {
        let monitor = CapacityMonitor::new(100);
        monitor.add(node(1), 10);
        monitor.sub(node(1), 50);
        assert_eq!(monitor.used_total(), 0);
        assert_eq!(monitor.used_for(&node(1)), 0);
    }
}
