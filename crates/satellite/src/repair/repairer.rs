//! The segment repairer.
//!
//! For one injured segment: re-read the pointer (it may have self-healed),
//! partition its pieces into healthy and lost, pick replacement nodes that
//! exclude everything already in the pointer, download enough surviving
//! pieces to reconstruct, re-encode exactly the lost piece numbers, upload
//! to the replacements, validate the returned signed hashes the same way
//! the commit path does, and swap the piece list with a compare-and-swap on
//! the pointer pre-image. Losing the CAS discards the attempt; the uploaded
//! pieces age into garbage and the next retain cycle reclaims them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use orbit_common::config::RepairConfig;
use orbit_common::error::{Error, Result};
use orbit_common::id::NodeId;
use orbit_common::identity::Identity;
use orbit_common::orders::{Action, PieceHash};
use orbit_common::path::SegmentPath;
use orbit_common::pointer::{RemotePiece, RemoteSegment};
use orbit_common::time::now_ms;
use orbit_erasure::ErasureScheme;

use crate::metainfo::Service;
use crate::orders::OrdersService;
use crate::overlay::{FindRequest, NodeDossier, OverlayService};
use crate::repair::queue::RepairQueue;
use crate::transport::PieceTransport;

/// What one repair attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    Repaired { added: usize, removed: usize },
    /// Nothing to do: deleted, inline, or self-healed past the threshold.
    Skipped(&'static str),
    /// Below the reconstruction minimum; surfaced to operators.
    Irreparable,
}

pub struct SegmentRepairer {
    identity: Arc<Identity>,
    metainfo: Arc<Service>,
    overlay: Arc<OverlayService>,
    orders: Arc<OrdersService>,
    transport: Arc<dyn PieceTransport>,
    config: RepairConfig,
}

impl SegmentRepairer {
    pub fn new(
        identity: Arc<Identity>,
        metainfo: Arc<Service>,
        overlay: Arc<OverlayService>,
        orders: Arc<OrdersService>,
        transport: Arc<dyn PieceTransport>,
        config: RepairConfig,
    ) -> Self {
        SegmentRepairer {
            identity,
            metainfo,
            overlay,
            orders,
            transport,
            config,
        }
    }

    fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.config.transfer_timeout_ms)
    }

    async fn download_piece(
        &self,
        remote: &RemoteSegment,
        piece: &RemotePiece,
        dossier: &NodeDossier,
        piece_len: u64,
    ) -> Option<(usize, Vec<u8>)> {
        let derived = remote.root_piece_id.derive(&piece.node_id, piece.piece_num);
        let (limit, order) = self
            .orders
            .issue_for_worker(piece.node_id, derived, Action::GetRepair, piece_len)
            .ok()?;
        match self
            .transport
            .download(&dossier.address, &limit, &order, 0, piece_len, self.transfer_timeout())
            .await
        {
            Ok(bytes) if bytes.len() == piece_len as usize => {
                Some((piece.piece_num as usize, bytes))
            }
            Ok(_) => {
                warn!(node = %piece.node_id, "repair download truncated");
                None
            }
            Err(err) => {
                warn!(node = %piece.node_id, %err, "repair download failed");
                None
            }
        }
    }

    async fn upload_piece(
        &self,
        remote: &RemoteSegment,
        piece_num: u16,
        replacement: &NodeDossier,
        payload: &[u8],
    ) -> Option<RemotePiece> {
        let derived = remote.root_piece_id.derive(&replacement.node_id, piece_num);
        let payload_hash = sha256(payload);
        let uplink_hash = PieceHash::sign(
            &self.identity,
            derived,
            payload_hash,
            payload.len() as u64,
            now_ms(),
        );
        let (limit, order) = self
            .orders
            .issue_for_worker(
                replacement.node_id,
                derived,
                Action::PutRepair,
                payload.len() as u64,
            )
            .ok()?;
        let node_hash = match self
            .transport
            .upload(
                &replacement.address,
                &limit,
                &uplink_hash,
                payload,
                &order,
                self.transfer_timeout(),
            )
            .await
        {
            Ok(hash) => hash,
            Err(err) => {
                warn!(node = %replacement.node_id, %err, "repair upload failed");
                return None;
            }
        };

        // validate the returned hash exactly as the commit path does
        if node_hash.piece_id != derived
            || node_hash.hash != payload_hash
            || node_hash.piece_size != payload.len() as u64
            || node_hash.verify_signature(&replacement.public_key).is_err()
        {
            warn!(node = %replacement.node_id, "repair upload returned invalid piece hash");
            return None;
        }
        Some(RemotePiece {
            piece_num,
            node_id: replacement.node_id,
            hash: Some(node_hash),
        })
    }

    /// Repair one segment. Errors mean the attempt failed and should be
    /// retried (or dead-lettered) by the caller; `Ok` outcomes are final for
    /// this queue entry.
    pub async fn repair(&self, path: &SegmentPath) -> Result<RepairOutcome> {
        let pointer = match self.metainfo.get(path) {
            Ok(pointer) => pointer,
            Err(ref err) if err.is_not_found() => return Ok(RepairOutcome::Skipped("deleted")),
            Err(err) => return Err(err),
        };
        let remote = match pointer.remote() {
            Some(remote) => remote.clone(),
            None => return Ok(RepairOutcome::Skipped("inline")),
        };
        let scheme = ErasureScheme::from_redundancy(&remote.redundancy)
            .map_err(|e| Error::invalid(format!("pointer redundancy: {}", e)))?;

        // partition against the current overlay state
        let mut healthy: Vec<(RemotePiece, NodeDossier)> = Vec::new();
        let mut lost_nodes: Vec<NodeId> = Vec::new();
        let mut lost_nums: Vec<u16> = remote.missing_piece_nums();
        for piece in &remote.pieces {
            match self.overlay.get(&piece.node_id) {
                Ok(dossier) if !dossier.reputation.is_disqualified() => {
                    healthy.push((piece.clone(), dossier));
                }
                _ => {
                    lost_nodes.push(piece.node_id);
                    lost_nums.push(piece.piece_num);
                }
            }
        }

        let healthy_count = healthy.len() as u16;
        if healthy_count > remote.redundancy.repair {
            return Ok(RepairOutcome::Skipped("self-healed"));
        }
        if healthy_count < remote.redundancy.required {
            error!(%path, healthy_count, "segment below reconstruction minimum");
            return Ok(RepairOutcome::Irreparable);
        }
        lost_nums.sort_unstable();
        lost_nums.dedup();
        if lost_nums.is_empty() {
            return Ok(RepairOutcome::Skipped("nothing lost"));
        }

        // replacements must exclude every node already in the pointer
        let excluded: HashSet<NodeId> = remote.pieces.iter().map(|p| p.node_id).collect();
        let replacements = self.overlay.find_storage_nodes(&FindRequest {
            count: lost_nums.len(),
            free_disk: 0,
            free_bandwidth: 0,
            excluded,
        })?;

        // download surviving pieces; any k of them reconstruct the segment
        let piece_len =
            remote.redundancy.stripe_count(pointer.segment_size) * remote.redundancy.share_size as u64;
        let downloads = healthy
            .iter()
            .map(|(piece, dossier)| self.download_piece(&remote, piece, dossier, piece_len));
        let downloaded: Vec<(usize, Vec<u8>)> =
            join_all(downloads).await.into_iter().flatten().collect();
        if downloaded.len() < scheme.required() {
            return Err(Error::unavailable(format!(
                "repair of {} got {} pieces, need {}",
                path,
                downloaded.len(),
                scheme.required()
            )));
        }

        let rebuilt = scheme
            .rebuild_pieces(&downloaded, &lost_nums, pointer.segment_size)
            .map_err(|e| Error::internal(format!("re-encode failed: {}", e)))?;

        // place each rebuilt piece on its replacement node
        let uploads = rebuilt
            .iter()
            .zip(replacements.iter())
            .map(|((piece_num, payload), replacement)| {
                self.upload_piece(&remote, *piece_num, replacement, payload)
            });
        let new_pieces: Vec<RemotePiece> = join_all(uploads).await.into_iter().flatten().collect();
        if new_pieces.is_empty() {
            return Err(Error::unavailable(format!(
                "repair of {} placed no replacement pieces",
                path
            )));
        }

        let added = new_pieces.len();
        let removed = lost_nodes.len();
        // CAS on the pre-image read at the top; a raced writer wins and this
        // attempt's uploads become garbage for the next retain cycle
        self.metainfo
            .update_pieces(path, &pointer, new_pieces, &lost_nodes)?;

        info!(%path, added, removed, "segment repaired");
        Ok(RepairOutcome::Repaired { added, removed })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// WORKER LOOP
// ════════════════════════════════════════════════════════════════════════════

pub struct RepairWorker {
    repairer: Arc<SegmentRepairer>,
    queue: Arc<RepairQueue>,
}

impl RepairWorker {
    #[must_use]
    pub fn new(repairer: Arc<SegmentRepairer>, queue: Arc<RepairQueue>) -> Self {
        RepairWorker { repairer, queue }
    }

    /// Process one queue entry, if any. Returns the outcome for telemetry.
    pub async fn run_once(&self) -> Option<RepairOutcome> {
        let injured = self.queue.dequeue(now_ms())?;
        match self.repairer.repair(&injured.path).await {
            Ok(outcome) => {
                debug!(path = %injured.path, ?outcome, "repair attempt finished");
                self.queue.complete(&injured.path);
                Some(outcome)
            }
            Err(err) => {
                warn!(path = %injured.path, %err, "repair attempt failed");
                self.queue.fail(&injured.path);
                None
            }
        }
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}
