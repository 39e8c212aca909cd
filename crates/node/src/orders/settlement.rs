//! Receipt settlement.
//!
//! Every served request leaves a `(limit, order)` pair in the unsent set.
//! The settlement agent periodically drains the set and streams each batch
//! to its issuing satellite; the satellite inserts idempotently keyed by
//! (serial, storage node), so redelivery after a failed submit is harmless.
//! Batches that fail to submit are re-queued for the next cycle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use orbit_common::error::Result;
use orbit_common::id::NodeId;
pub use orbit_proto::SettlementItem;

/// Satellite-side acceptance counts for one settlement batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SettlementSummary {
    pub accepted: usize,
    pub rejected: usize,
}

/// The authenticated settlement channel to one satellite. Implemented by the
/// satellite's orders service (in-process for tests, RPC in deployment).
#[async_trait]
pub trait SettlementSink: Send + Sync {
    async fn settle(
        &self,
        storage_node: NodeId,
        items: Vec<SettlementItem>,
    ) -> Result<SettlementSummary>;
}

/// Unsubmitted receipts, grouped by issuing satellite.
#[derive(Debug, Default)]
pub struct UnsentOrders {
    inner: Mutex<HashMap<NodeId, Vec<SettlementItem>>>,
}

impl UnsentOrders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, satellite: NodeId, item: SettlementItem) {
        self.inner.lock().entry(satellite).or_default().push(item);
    }

    /// Drain everything, leaving the set empty.
    pub fn take_all(&self) -> HashMap<NodeId, Vec<SettlementItem>> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn requeue(&self, satellite: NodeId, items: Vec<SettlementItem>) {
        self.inner.lock().entry(satellite).or_default().extend(items);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }
}

/// Drains the unsent set towards the configured satellites.
pub struct SettlementAgent {
    node_id: NodeId,
    unsent: Arc<UnsentOrders>,
    sinks: HashMap<NodeId, Arc<dyn SettlementSink>>,
}

impl SettlementAgent {
    #[must_use]
    pub fn new(node_id: NodeId, unsent: Arc<UnsentOrders>) -> Self {
        SettlementAgent {
            node_id,
            unsent,
            sinks: HashMap::new(),
        }
    }

    pub fn register_sink(&mut self, satellite: NodeId, sink: Arc<dyn SettlementSink>) {
        self.sinks.insert(satellite, sink);
    }

    /// One settlement cycle. Returns how many receipts were accepted.
    pub async fn run_once(&self) -> usize {
        let mut accepted_total = 0;
        for (satellite, items) in self.unsent.take_all() {
            let count = items.len();
            let sink = match self.sinks.get(&satellite) {
                Some(sink) => sink.clone(),
                None => {
                    warn!(%satellite, count, "no settlement channel, requeueing");
                    self.unsent.requeue(satellite, items);
                    continue;
                }
            };
            match sink.settle(self.node_id, items.clone()).await {
                Ok(summary) => {
                    accepted_total += summary.accepted;
                    info!(
                        %satellite,
                        accepted = summary.accepted,
                        rejected = summary.rejected,
                        "settlement batch submitted"
                    );
                }
                Err(err) => {
                    warn!(%satellite, count, %err, "settlement failed, requeueing");
                    self.unsent.requeue(satellite, items);
                }
            }
        }
        accepted_total
    }
}
