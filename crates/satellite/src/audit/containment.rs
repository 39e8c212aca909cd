//! Containment: pending re-audits for nodes with inconclusive outcomes.
//!
//! ## Contract
//!
//! - At most one entry per node; inserting over an existing entry replaces
//!   it (the most recent inconclusive audit supersedes).
//! - Entries age out after the configured window if never reverified; the
//!   node is presumed to have been offline for that period and the caller
//!   converts each aged-out entry into an offline tally.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use orbit_common::id::NodeId;

use super::PendingAudit;

#[derive(Debug, Clone)]
struct Entry {
    pending: PendingAudit,
    created_ms: u64,
}

#[derive(Debug)]
pub struct Containment {
    window_ms: u64,
    entries: RwLock<HashMap<NodeId, Entry>>,
}

impl Containment {
    #[must_use]
    pub fn new(window_ms: u64) -> Self {
        Containment {
            window_ms,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace the pending audit for a node.
    pub fn insert(&self, pending: PendingAudit, now_ms: u64) {
        debug!(node = %pending.node_id, stripe = pending.stripe_index, "pending audit recorded");
        self.entries.write().insert(
            pending.node_id,
            Entry {
                pending,
                created_ms: now_ms,
            },
        );
    }

    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<PendingAudit> {
        self.entries.read().get(node_id).map(|e| e.pending.clone())
    }

    /// Remove a node's entry. Returns whether one existed.
    pub fn delete(&self, node_id: &NodeId) -> bool {
        self.entries.write().remove(node_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries older than the window. The caller converts each into
    /// an offline tally.
    pub fn age_out(&self, now_ms: u64) -> Vec<PendingAudit> {
        let mut entries = self.entries.write();
        let expired: Vec<NodeId> = entries
            .iter()
            .filter(|(_, e)| e.created_ms + self.window_ms < now_ms)
            .map(|(node, _)| *node)
            .collect();
        expired
            .into_iter()
            .filter_map(|node| entries.remove(&node).map(|e| e.pending))
            .collect()
    }
}
