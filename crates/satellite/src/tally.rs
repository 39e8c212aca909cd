//! Storage tally and bandwidth consistency check.
//!
//! The tally walks the pointer store and computes, per node, how many bytes
//! of piece data the pointers say that node is holding. Comparing that
//! against the settled PUT totals catches nodes whose receipts claim far
//! more upload traffic than the pointers can account for: receipts are
//! paid, so inflating them must cost the node its standing.
//!
//! A node is flagged only when its settled PUT bytes exceed the pointer
//! expectation by more than the configured ratio. The opposite direction is
//! normal: deleted segments stop counting in the tally long before their
//! receipts age out of the rollup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use orbit_common::id::NodeId;
use orbit_common::orders::Action;

use crate::metainfo::{ListOptions, Service};
use crate::orders::OrdersService;
use crate::overlay::OverlayService;

/// Settled PUT bytes may exceed pointer bytes by this factor before a node
/// is flagged.
const DEFAULT_TOLERANCE: f64 = 2.0;

/// Absolute slack on top of the ratio, covering receipts for segments that
/// were deleted after upload.
const SLACK_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TallyStats {
    pub nodes_tallied: usize,
    pub nodes_flagged: usize,
}

pub struct Tally {
    metainfo: Arc<Service>,
    orders: Arc<OrdersService>,
    overlay: Arc<OverlayService>,
    tolerance: f64,
    slack_bytes: u64,
}

impl Tally {
    #[must_use]
    pub fn new(
        metainfo: Arc<Service>,
        orders: Arc<OrdersService>,
        overlay: Arc<OverlayService>,
    ) -> Self {
        Self::with_limits(metainfo, orders, overlay, DEFAULT_TOLERANCE, SLACK_BYTES)
    }

    #[must_use]
    pub fn with_limits(
        metainfo: Arc<Service>,
        orders: Arc<OrdersService>,
        overlay: Arc<OverlayService>,
        tolerance: f64,
        slack_bytes: u64,
    ) -> Self {
        Tally {
            metainfo,
            orders,
            overlay,
            tolerance,
            slack_bytes,
        }
    }

    /// Bytes of piece data each node holds according to the pointers.
    #[must_use]
    pub fn stored_bytes_per_node(&self) -> HashMap<NodeId, u64> {
        let mut per_node: HashMap<NodeId, u64> = HashMap::new();
        for (_, pointer) in self.metainfo.list(&ListOptions::default()) {
            let remote = match pointer.remote() {
                Some(remote) => remote,
                None => continue,
            };
            let piece_bytes = remote.redundancy.stripe_count(pointer.segment_size)
                * remote.redundancy.share_size as u64;
            for piece in &remote.pieces {
                *per_node.entry(piece.node_id).or_insert(0) += piece_bytes;
            }
        }
        per_node
    }

    /// Compare settled PUT totals against the pointer tally and disqualify
    /// nodes whose claimed uploads cannot be accounted for.
    pub fn run_once(&self) -> TallyStats {
        let expected = self.stored_bytes_per_node();
        let mut stats = TallyStats::default();

        for node_id in self.overlay.node_ids() {
            stats.nodes_tallied += 1;
            let put_bytes = self.orders.rollup().total(&node_id, Action::Put)
                + self.orders.rollup().total(&node_id, Action::PutRepair);
            let pointer_bytes = expected.get(&node_id).copied().unwrap_or(0);
            let ceiling = pointer_bytes as f64 * self.tolerance + self.slack_bytes as f64;
            if put_bytes as f64 > ceiling {
                warn!(
                    node = %node_id,
                    put_bytes,
                    pointer_bytes,
                    "settled uploads exceed pointer accounting, disqualifying"
                );
                if self.overlay.disqualify(&node_id).is_ok() {
                    stats.nodes_flagged += 1;
                }
            }
        }
        if stats.nodes_flagged > 0 {
            info!(
                tallied = stats.nodes_tallied,
                flagged = stats.nodes_flagged,
                "tally consistency check complete"
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_common::config::{NodeSelectionConfig, OrdersConfig};
    use orbit_common::id::PieceId;
    use orbit_common::identity::Identity;
    use orbit_common::orders::Order;
    use orbit_common::path::{SegmentPath, SegmentRef};
    use orbit_common::pointer::{Pointer, RedundancyScheme, RemotePiece, RemoteSegment};
    use orbit_proto::SettlementItem;

    struct Fixture {
        metainfo: Arc<Service>,
        orders: Arc<OrdersService>,
        overlay: Arc<OverlayService>,
        uplink: Identity,
    }

    fn fixture() -> Fixture {
        Fixture {
            metainfo: Arc::new(Service::new()),
            orders: Arc::new(OrdersService::new(
                Arc::new(Identity::generate()),
                OrdersConfig::default(),
            )),
            overlay: Arc::new(OverlayService::new(NodeSelectionConfig::default())),
            uplink: Identity::generate(),
        }
    }

    fn settle_put(fix: &Fixture, node: NodeId, bytes: u64) {
        let limit = fix
            .orders
            .issue(
                fix.uplink.node_id(),
                fix.uplink.public_key(),
                node,
                PieceId::generate(),
                Action::Put,
                bytes,
                None,
            )
            .expect("issue");
        let order = Order::sign(&fix.uplink, &limit, bytes);
        let summary = fix.orders.settle(node, &[SettlementItem { limit, order }]);
        assert_eq!(summary.accepted, 1);
    }

    #[test]
    fn test_accounted_uploads_pass() {
        let fix = fixture();
        let node = fix
            .overlay
            .update_contact(Identity::generate().public_key(), "addr".into(), 1, 1);

        // a pointer accounting for 512 bytes on this node
        let pointer = Pointer::new_remote(
            RemoteSegment {
                redundancy: RedundancyScheme {
                    required: 2,
                    repair: 2,
                    optimal: 3,
                    total: 4,
                    share_size: 256,
                },
                root_piece_id: PieceId::generate(),
                pieces: vec![RemotePiece {
                    piece_num: 0,
                    node_id: node,
                    hash: None,
                }],
                pieces_hashes_verified: true,
            },
            1024,
            1,
        );
        let path = SegmentPath::new("p", SegmentRef::Last, "b", b"o").expect("path");
        fix.metainfo.put(&path, pointer).expect("put");
        settle_put(&fix, node, 512);

        let tally = Tally::with_limits(
            fix.metainfo.clone(),
            fix.orders.clone(),
            fix.overlay.clone(),
            2.0,
            64,
        );
        let stats = tally.run_once();
        assert_eq!(stats.nodes_flagged, 0);
        assert!(!fix.overlay.get(&node).expect("dossier").reputation.is_disqualified());
    }

    #[test]
    fn test_unaccounted_uploads_disqualify() {
        let fix = fixture();
        let node = fix
            .overlay
            .update_contact(Identity::generate().public_key(), "addr".into(), 1, 1);
        // no pointers at all, yet the node settled a large PUT receipt
        settle_put(&fix, node, 10_000);

        let tally = Tally::with_limits(
            fix.metainfo.clone(),
            fix.orders.clone(),
            fix.overlay.clone(),
            2.0,
            64,
        );
        let stats = tally.run_once();
        assert_eq!(stats.nodes_flagged, 1);
        assert!(fix.overlay.get(&node).expect("dossier").reputation.is_disqualified());
    }
}
