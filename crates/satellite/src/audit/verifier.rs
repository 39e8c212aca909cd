//! The audit verifier: downloads one stripe's shares and classifies every
//! node in the pointer.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use orbit_common::config::AuditConfig;
use orbit_common::error::{Error, Result};
use orbit_common::id::NodeId;
use orbit_common::identity::Identity;
use orbit_common::orders::Action;
use orbit_common::path::SegmentPath;
use orbit_common::pointer::{Pointer, RemoteSegment};
use orbit_common::time::now_ms;
use orbit_erasure::ErasureScheme;

use crate::audit::containment::Containment;
use crate::audit::{PendingAudit, Report};
use crate::metainfo;
use crate::orders::OrdersService;
use crate::overlay::OverlayService;
use crate::transport::{PieceTransport, TransportError};

/// Per-node outcome of one share download.
#[derive(Debug)]
enum ShareOutcome {
    Data(Vec<u8>),
    Offline,
    Missing,
    Contained,
}

#[derive(Debug)]
struct ShareResult {
    piece_num: u16,
    node_id: NodeId,
    outcome: ShareOutcome,
}

pub struct Verifier {
    identity: Arc<Identity>,
    metainfo: Arc<metainfo::Service>,
    overlay: Arc<OverlayService>,
    orders: Arc<OrdersService>,
    containment: Arc<Containment>,
    transport: Arc<dyn PieceTransport>,
    config: AuditConfig,
}

impl Verifier {
    pub fn new(
        identity: Arc<Identity>,
        metainfo: Arc<metainfo::Service>,
        overlay: Arc<OverlayService>,
        orders: Arc<OrdersService>,
        containment: Arc<Containment>,
        transport: Arc<dyn PieceTransport>,
        config: AuditConfig,
    ) -> Self {
        Verifier {
            identity,
            metainfo,
            overlay,
            orders,
            containment,
            transport,
            config,
        }
    }

    /// Per-share download budget: scales with share size, floored.
    fn share_timeout(&self, share_size: u32) -> Duration {
        let scaled_ms = (share_size as u64).saturating_mul(1000) / self.config.min_bytes_per_second.max(1);
        Duration::from_millis(scaled_ms.max(self.config.min_download_timeout_ms))
    }

    fn classify(error: &TransportError) -> ShareOutcome {
        match error {
            TransportError::DialTimeout | TransportError::DialFailed(_) => ShareOutcome::Offline,
            TransportError::NotFound(_) => ShareOutcome::Missing,
            // stalled transfer after a successful dial, or anything
            // ambiguous: the node gets a pending audit, not a verdict
            TransportError::Timeout
            | TransportError::PermissionDenied(_)
            | TransportError::Other(_) => ShareOutcome::Contained,
        }
    }

    async fn download_one(
        &self,
        remote: &RemoteSegment,
        node_id: NodeId,
        piece_num: u16,
        stripe_index: u64,
    ) -> ShareResult {
        let share_size = remote.redundancy.share_size;
        let dossier = match self.overlay.get(&node_id) {
            Ok(d) if !d.reputation.is_disqualified() => d,
            // unknown or disqualified: no order limit gets created
            _ => {
                return ShareResult {
                    piece_num,
                    node_id,
                    outcome: ShareOutcome::Offline,
                }
            }
        };
        let derived = remote.root_piece_id.derive(&node_id, piece_num);
        let (limit, order) = match self.orders.issue_for_worker(
            node_id,
            derived,
            Action::GetAudit,
            share_size as u64,
        ) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(node = %node_id, %err, "audit order limit not created");
                return ShareResult {
                    piece_num,
                    node_id,
                    outcome: ShareOutcome::Contained,
                };
            }
        };
        let offset = stripe_index * share_size as u64;
        let outcome = match self
            .transport
            .download(
                &dossier.address,
                &limit,
                &order,
                offset,
                share_size as u64,
                self.share_timeout(share_size),
            )
            .await
        {
            Ok(bytes) if bytes.len() == share_size as usize => ShareOutcome::Data(bytes),
            Ok(_) => ShareOutcome::Contained, // truncated share
            Err(err) => {
                debug!(node = %node_id, %err, "audit share download failed");
                Self::classify(&err)
            }
        };
        ShareResult {
            piece_num,
            node_id,
            outcome,
        }
    }

    /// Audit one segment at a random stripe.
    ///
    /// Nodes already holding a pending audit are skipped entirely; their
    /// verdict comes from [`Verifier::reverify`].
    pub async fn verify(&self, path: &SegmentPath) -> Result<Report> {
        let pointer = self.metainfo.get(path)?;
        let remote = match pointer.remote() {
            Some(remote) => remote.clone(),
            None => return Ok(Report::default()), // inline segments are not audited
        };
        let scheme = ErasureScheme::from_redundancy(&remote.redundancy)
            .map_err(|e| Error::invalid(format!("pointer redundancy: {}", e)))?;

        let num_stripes = pointer.segment_size / remote.redundancy.stripe_size();
        let stripe_index = if num_stripes == 0 {
            0
        } else {
            OsRng.gen_range(0..num_stripes)
        };

        let downloads = remote
            .pieces
            .iter()
            .filter(|piece| self.containment.get(&piece.node_id).is_none())
            .map(|piece| self.download_one(&remote, piece.node_id, piece.piece_num, stripe_index));
        let results: Vec<ShareResult> = join_all(downloads).await;

        // a repair or delete racing the audit voids the sample
        let refetched = self.check_segment_unaltered(path, &pointer)?;

        let mut report = Report::default();
        let mut candidates: Vec<(usize, Vec<u8>)> = Vec::new();
        let mut candidate_nodes: Vec<(u16, NodeId)> = Vec::new();
        let mut contained: Vec<(u16, NodeId)> = Vec::new();
        for result in results {
            match result.outcome {
                ShareOutcome::Data(bytes) => {
                    candidates.push((result.piece_num as usize, bytes));
                    candidate_nodes.push((result.piece_num, result.node_id));
                }
                ShareOutcome::Offline => report.offlines.push(result.node_id),
                ShareOutcome::Missing => report.fails.push(result.node_id),
                ShareOutcome::Contained => contained.push((result.piece_num, result.node_id)),
            }
        }

        if candidates.len() < scheme.required() {
            warn!(
                %path,
                got = candidates.len(),
                need = scheme.required(),
                "audit inconclusive: not enough shares"
            );
            return Ok(report); // offlines and fails only; nobody is credited
        }

        let corrected = match scheme.correct(&candidates) {
            Ok(corrected) => corrected,
            Err(err) => {
                warn!(%path, %err, "audit correction failed");
                return Ok(report);
            }
        };

        // shares that do not match the corrected codeword were altered
        let mut altered_nodes: Vec<NodeId> = Vec::new();
        for ((piece_num, node_id), (_, bytes)) in candidate_nodes.iter().zip(&candidates) {
            if &corrected.shares[*piece_num as usize] != bytes {
                altered_nodes.push(*node_id);
            }
        }
        if !altered_nodes.is_empty() {
            // drop altered pieces so the node is not penalized twice before
            // repair rewrites the pointer
            if let Err(err) =
                self.metainfo
                    .update_pieces(path, &refetched, Vec::new(), &altered_nodes)
            {
                warn!(%path, %err, "failed to remove altered pieces");
            }
        }

        for (_, node_id) in &candidate_nodes {
            if altered_nodes.contains(node_id) {
                report.fails.push(*node_id);
            } else {
                report.successes.push(*node_id);
            }
        }

        // contained nodes get a pending audit carrying the share they owed
        let now = now_ms();
        for (piece_num, node_id) in contained {
            let expected = &corrected.shares[piece_num as usize];
            let pending = PendingAudit {
                node_id,
                piece_id: remote.root_piece_id,
                stripe_index,
                share_size: remote.redundancy.share_size,
                expected_share_hash: sha256(expected),
                path: path.clone(),
            };
            self.containment.insert(pending.clone(), now);
            report.pending_audits.push(pending);
        }

        debug!(
            %path,
            stripe = stripe_index,
            successes = report.successes.len(),
            fails = report.fails.len(),
            offlines = report.offlines.len(),
            contained = report.pending_audits.len(),
            "audit complete"
        );
        Ok(report)
    }

    /// Resolve pending audits for the nodes of one segment.
    ///
    /// A node that has disappeared from its pending pointer is dropped
    /// silently — no success, no failure — on every path that detects it.
    pub async fn reverify(&self, path: &SegmentPath) -> Result<Report> {
        let pointer = self.metainfo.get(path)?;
        let remote = match pointer.remote() {
            Some(remote) => remote.clone(),
            None => return Ok(Report::default()),
        };

        let mut report = Report::default();
        for piece in &remote.pieces {
            let pending = match self.containment.get(&piece.node_id) {
                Some(pending) => pending,
                None => continue,
            };
            self.reverify_one(&pending, &mut report).await;
        }
        Ok(report)
    }

    async fn reverify_one(&self, pending: &PendingAudit, report: &mut Report) {
        let node_id = pending.node_id;

        // the pending pointer may differ from the segment that triggered us
        let pending_pointer = match self.metainfo.get(&pending.path) {
            Ok(pointer) => pointer,
            Err(_) => {
                // segment deleted since containment: drop silently
                self.containment.delete(&node_id);
                return;
            }
        };
        let remote = match pending_pointer.remote() {
            Some(remote) => remote.clone(),
            None => {
                self.containment.delete(&node_id);
                return;
            }
        };
        if remote.root_piece_id != pending.piece_id {
            // segment rewritten since containment: the owed share no longer
            // exists anywhere
            self.containment.delete(&node_id);
            return;
        }
        let piece_num = match remote.piece_for_node(&node_id) {
            Some(piece) => piece.piece_num,
            None => {
                // node vanished from the pointer: drop silently
                self.containment.delete(&node_id);
                return;
            }
        };

        let dossier = match self.overlay.get(&node_id) {
            Ok(d) if !d.reputation.is_disqualified() => d,
            Ok(_) => {
                self.containment.delete(&node_id);
                return;
            }
            Err(_) => {
                report.offlines.push(node_id);
                return;
            }
        };

        let derived = pending.piece_id.derive(&node_id, piece_num);
        let (limit, order) = match self.orders.issue_for_worker(
            node_id,
            derived,
            Action::GetAudit,
            pending.share_size as u64,
        ) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(node = %node_id, %err, "reverify order limit not created");
                return;
            }
        };

        let offset = pending.stripe_index * pending.share_size as u64;
        match self
            .transport
            .download(
                &dossier.address,
                &limit,
                &order,
                offset,
                pending.share_size as u64,
                self.share_timeout(pending.share_size),
            )
            .await
        {
            Ok(bytes) => {
                if sha256(&bytes) == pending.expected_share_hash {
                    debug!(node = %node_id, "reverify: hashes match");
                    report.successes.push(node_id);
                } else {
                    debug!(node = %node_id, "reverify: hashes mismatch");
                    report.fails.push(node_id);
                    if let Err(err) = self.metainfo.update_pieces(
                        &pending.path,
                        &pending_pointer,
                        Vec::new(),
                        &[node_id],
                    ) {
                        warn!(node = %node_id, %err, "reverify: failed to remove piece");
                    }
                }
                self.containment.delete(&node_id);
            }
            Err(err) => match Self::classify(&err) {
                ShareOutcome::Offline => {
                    // keep the pending audit; the node may come back
                    report.offlines.push(node_id);
                }
                ShareOutcome::Missing => {
                    report.fails.push(node_id);
                    self.containment.delete(&node_id);
                    if let Err(err) = self.metainfo.update_pieces(
                        &pending.path,
                        &pending_pointer,
                        Vec::new(),
                        &[node_id],
                    ) {
                        warn!(node = %node_id, %err, "reverify: failed to remove piece");
                    }
                }
                // still ambiguous: the entry stays contained
                _ => debug!(node = %node_id, %err, "reverify: still inconclusive"),
            },
        }
    }

    fn check_segment_unaltered(&self, path: &SegmentPath, before: &Pointer) -> Result<Pointer> {
        let current = self
            .metainfo
            .get(path)
            .map_err(|_| Error::not_found(format!("segment {} deleted during audit", path)))?;
        if current.creation_ms != before.creation_ms {
            return Err(Error::unavailable(format!(
                "segment {} altered during audit",
                path
            )));
        }
        Ok(current)
    }

    #[must_use]
    pub fn auditor_id(&self) -> NodeId {
        self.identity.node_id()
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}
