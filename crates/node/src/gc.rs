//! Garbage collection and TTL expiry.
//!
//! The satellite snapshots its pointer DB, builds a bloom filter of every
//! derived piece id it believes this node holds, and ships it with a
//! `created_before` watermark. The node deletes pieces that are absent from
//! the filter AND older than the watermark — the watermark protects pieces
//! whose upload committed after the snapshot was taken. Bloom false
//! positives only retain garbage until the next cycle; live pieces are never
//! deleted.
//!
//! The expiry sweep walks piece headers and deletes pieces whose order limit
//! carried a `piece_expiration` in the past. Files whose header cannot be
//! read are quarantined by the open path and counted as failed here; the
//! status summary is what the node reports back to the satellite.

use tracing::{info, warn};

use orbit_common::error::Result;
use orbit_common::id::{NodeId, PieceId};
pub use orbit_proto::{GcSummary, RetainRequest};

use crate::pieces::PieceStore;

/// Delete pieces for `satellite` that the retain filter no longer covers.
pub fn apply_retain(
    store: &PieceStore,
    satellite: NodeId,
    request: &RetainRequest,
) -> Result<GcSummary> {
    let mut summary = GcSummary::default();
    for info in store.list(&satellite)? {
        summary.checked += 1;
        if request.filter.contains(&info.key) {
            continue;
        }
        if info.modified_ms >= request.created_before_ms {
            // committed after the satellite snapshot; not provably garbage
            continue;
        }
        let piece = PieceId(info.key);
        match store.delete(satellite, piece) {
            Ok(true) => {
                summary.deleted += 1;
                summary.reclaimed_bytes += info.size;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(%satellite, %piece, %err, "retain: delete failed");
                summary.failed += 1;
            }
        }
    }
    info!(
        %satellite,
        checked = summary.checked,
        deleted = summary.deleted,
        reclaimed = summary.reclaimed_bytes,
        "retain pass complete"
    );
    Ok(summary)
}

/// Delete pieces whose `piece_expiration` has passed.
pub fn sweep_expired(store: &PieceStore, satellite: NodeId, now_ms: u64) -> Result<GcSummary> {
    let mut summary = GcSummary::default();
    for info in store.list(&satellite)? {
        summary.checked += 1;
        let piece = PieceId(info.key);
        let expiration = match store.open(satellite, piece) {
            Ok(reader) => reader.header().order_limit.piece_expiration_ms,
            Err(err) => {
                // open already quarantined unreadable files
                warn!(%satellite, %piece, %err, "expiry sweep: unreadable piece");
                summary.failed += 1;
                continue;
            }
        };
        if matches!(expiration, Some(exp) if exp < now_ms) {
            match store.delete(satellite, piece) {
                Ok(true) => {
                    summary.deleted += 1;
                    summary.reclaimed_bytes += info.size;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(%satellite, %piece, %err, "expiry sweep: delete failed");
                    summary.failed += 1;
                }
            }
        }
    }
    if summary.deleted > 0 || summary.failed > 0 {
        info!(
            %satellite,
            deleted = summary.deleted,
            failed = summary.failed,
            "expiry sweep complete"
        );
    }
    Ok(summary)
}
