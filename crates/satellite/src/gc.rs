//! Garbage-collection sender.
//!
//! Snapshots the pointer store, folds every derived piece id into one bloom
//! filter per storage node, and pushes the signed retain request to each
//! node. The watermark is taken before the walk starts: a piece whose
//! upload committed after the snapshot is always newer than the watermark,
//! so the node keeps it even though it is missing from the filter.
//!
//! The filter is sized for a false-positive rate of 1e-4; a false positive
//! only retains garbage until the next cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use orbit_common::bloom::BloomFilter;
use orbit_common::id::NodeId;
use orbit_common::identity::Identity;
use orbit_common::time::now_ms;
use orbit_proto::{RetainRequest, SignedRetain};

use crate::metainfo::{ListOptions, Service};
use crate::overlay::OverlayService;
use crate::transport::PieceTransport;

const RETAIN_FP_RATE: f64 = 1e-4;
const RETAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub nodes_contacted: usize,
    pub nodes_failed: usize,
    pub pieces_retained: usize,
    pub pieces_deleted: usize,
}

pub struct GarbageCollector {
    identity: Arc<Identity>,
    metainfo: Arc<Service>,
    overlay: Arc<OverlayService>,
    transport: Arc<dyn PieceTransport>,
}

impl GarbageCollector {
    #[must_use]
    pub fn new(
        identity: Arc<Identity>,
        metainfo: Arc<Service>,
        overlay: Arc<OverlayService>,
        transport: Arc<dyn PieceTransport>,
    ) -> Self {
        GarbageCollector {
            identity,
            metainfo,
            overlay,
            transport,
        }
    }

    /// Every derived piece id each node should currently hold.
    fn live_pieces_per_node(&self) -> HashMap<NodeId, Vec<[u8; 32]>> {
        let mut per_node: HashMap<NodeId, Vec<[u8; 32]>> = HashMap::new();
        for (_, pointer) in self.metainfo.list(&ListOptions::default()) {
            let remote = match pointer.remote() {
                Some(remote) => remote,
                None => continue,
            };
            for piece in &remote.pieces {
                let derived = remote.root_piece_id.derive(&piece.node_id, piece.piece_num);
                per_node.entry(piece.node_id).or_default().push(*derived.as_bytes());
            }
        }
        per_node
    }

    /// One collection cycle across every known node.
    pub async fn run_once(&self) -> GcStats {
        // watermark before the walk: uploads racing the snapshot stay safe
        let created_before_ms = now_ms();
        let per_node = self.live_pieces_per_node();
        let nodes = self.overlay.node_ids();

        let mut stats = GcStats::default();
        for node_id in &nodes {
            let dossier = match self.overlay.get(node_id) {
                Ok(d) if !d.reputation.is_disqualified() => d,
                _ => continue,
            };
            let live = per_node.get(node_id).map(Vec::as_slice).unwrap_or(&[]);
            let mut filter = BloomFilter::new(live.len(), RETAIN_FP_RATE);
            for id in live {
                filter.add(id);
            }
            stats.pieces_retained += live.len();

            let signed = match SignedRetain::sign(
                &self.identity,
                RetainRequest {
                    filter,
                    created_before_ms,
                },
            ) {
                Ok(signed) => signed,
                Err(err) => {
                    warn!(node = %node_id, %err, "retain request signing failed");
                    stats.nodes_failed += 1;
                    continue;
                }
            };
            match self
                .transport
                .retain(&dossier.address, &signed, RETAIN_TIMEOUT)
                .await
            {
                Ok(summary) => {
                    stats.nodes_contacted += 1;
                    stats.pieces_deleted += summary.deleted;
                }
                Err(err) => {
                    warn!(node = %node_id, %err, "retain push failed");
                    stats.nodes_failed += 1;
                }
            }
        }
        if stats.pieces_deleted > 0 || stats.nodes_failed > 0 {
            info!(
                contacted = stats.nodes_contacted,
                failed = stats.nodes_failed,
                deleted = stats.pieces_deleted,
                "garbage collection cycle complete"
            );
        }
        stats
    }
}
