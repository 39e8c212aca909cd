//! Pointer store.
//!
//! A byte-safe ordered map from segment paths to pointers. Keys are raw
//! bytes because encrypted path components may contain anything; iteration
//! is lexicographic with prefix / start-after / limit options.
//!
//! ## Invariants
//!
//! - `put` and `update_pieces` are linearizable per path; concurrent
//!   `update_pieces` calls serialize through compare-and-swap on the pointer
//!   pre-image, so a raced delete cannot be resurrected and a raced repair
//!   cannot be half-applied. The loser gets a conflict and retries or
//!   discards.
//! - Every stored pointer passes [`Pointer::validate`]: unique piece
//!   numbers, unique node ids, sane redundancy.
//! - `pieces_hashes_verified` is set by the commit path once
//!   [`Service::filter_valid_pieces`] has checked the signed hashes; it is
//!   never reset.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::{debug, warn};

use orbit_common::error::{Error, Result};
use orbit_common::id::NodeId;
use orbit_common::identity::PublicKey;
use orbit_common::path::{SegmentPath, SegmentRef};
use orbit_common::pointer::{Pointer, RemotePiece, RemoteSegment};

/// Source of node public keys for piece-hash validation. Implemented by the
/// overlay.
pub trait NodeKeySource: Send + Sync {
    fn public_key_for(&self, node_id: &NodeId) -> Option<PublicKey>;
}

/// Listing options. All bounds operate on raw key bytes.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<Vec<u8>>,
    pub start_after: Option<Vec<u8>>,
    pub end_before: Option<Vec<u8>>,
    pub limit: usize,
}

/// The satellite's pointer database and the operations the rest of the
/// satellite uses against it.
#[derive(Debug, Default)]
pub struct Service {
    db: RwLock<BTreeMap<Vec<u8>, Pointer>>,
}

impl Service {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic create-or-replace.
    pub fn put(&self, path: &SegmentPath, pointer: Pointer) -> Result<()> {
        pointer.validate()?;
        self.db.write().insert(path.as_bytes().to_vec(), pointer);
        Ok(())
    }

    pub fn get(&self, path: &SegmentPath) -> Result<Pointer> {
        self.db
            .read()
            .get(path.as_bytes())
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pointer {}", path)))
    }

    pub fn delete(&self, path: &SegmentPath) -> Result<()> {
        match self.db.write().remove(path.as_bytes()) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("pointer {}", path))),
        }
    }

    pub fn list(&self, options: &ListOptions) -> Vec<(SegmentPath, Pointer)> {
        let db = self.db.read();
        let lower = match &options.start_after {
            Some(key) => Bound::Excluded(key.clone()),
            None => match &options.prefix {
                Some(prefix) => Bound::Included(prefix.clone()),
                None => Bound::Unbounded,
            },
        };
        let upper = match &options.end_before {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for (key, pointer) in db.range((lower, upper)) {
            if let Some(prefix) = &options.prefix {
                if !key.starts_with(prefix) {
                    if key.as_slice() < prefix.as_slice() {
                        continue; // start-after landed below the prefix range
                    }
                    break; // lexicographic order: past the prefix range
                }
            }
            out.push((SegmentPath::from_raw(key.clone()), pointer.clone()));
            if options.limit > 0 && out.len() >= options.limit {
                break;
            }
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.db.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uniform random remote-segment path, for the audit chore. Uses the OS
    /// RNG: predictable sampling would let nodes precompute audits.
    #[must_use]
    pub fn random_remote_path(&self) -> Option<SegmentPath> {
        let db = self.db.read();
        let remote_keys: Vec<&Vec<u8>> = db
            .iter()
            .filter(|(_, pointer)| pointer.remote().is_some())
            .map(|(key, _)| key)
            .collect();
        if remote_keys.is_empty() {
            return None;
        }
        let index = OsRng.gen_range(0..remote_keys.len());
        Some(SegmentPath::from_raw(remote_keys[index].clone()))
    }

    /// Apply a piece-list change conditioned on the pointer pre-image.
    ///
    /// Pieces whose node id appears in `remove_nodes` are dropped, then
    /// `add` is appended. Returns the new pointer. A pre-image mismatch
    /// (concurrent writer won) surfaces as `Unavailable`; the caller decides
    /// between retry and discard.
    pub fn update_pieces(
        &self,
        path: &SegmentPath,
        pre_image: &Pointer,
        add: Vec<RemotePiece>,
        remove_nodes: &[NodeId],
    ) -> Result<Pointer> {
        let mut db = self.db.write();
        let current = db
            .get_mut(path.as_bytes())
            .ok_or_else(|| Error::not_found(format!("pointer {}", path)))?;
        if current != pre_image {
            return Err(Error::unavailable(format!(
                "pointer {} changed since read, update discarded",
                path
            )));
        }

        let mut updated = current.clone();
        let remote = updated
            .remote_mut()
            .ok_or_else(|| Error::invalid("update_pieces on inline segment"))?;
        remote
            .pieces
            .retain(|piece| !remove_nodes.contains(&piece.node_id));
        remote.pieces.extend(add);
        updated.validate()?;

        *current = updated.clone();
        debug!(%path, pieces = updated.remote().map(|r| r.pieces.len()).unwrap_or(0), "pointer pieces updated");
        Ok(updated)
    }

    /// Drop pieces whose node-signed hash is missing, unverifiable, or
    /// inconsistent with the derived piece id, then mark the segment
    /// verified. Returns how many pieces were dropped.
    pub fn filter_valid_pieces(remote: &mut RemoteSegment, keys: &dyn NodeKeySource) -> usize {
        let root = remote.root_piece_id;
        let before = remote.pieces.len();
        remote.pieces.retain(|piece| {
            let hash = match &piece.hash {
                Some(hash) => hash,
                None => {
                    warn!(node = %piece.node_id, num = piece.piece_num, "piece dropped: no signed hash");
                    return false;
                }
            };
            if hash.piece_id != root.derive(&piece.node_id, piece.piece_num) {
                warn!(node = %piece.node_id, num = piece.piece_num, "piece dropped: hash names wrong piece");
                return false;
            }
            let key = match keys.public_key_for(&piece.node_id) {
                Some(key) => key,
                None => {
                    warn!(node = %piece.node_id, "piece dropped: unknown node");
                    return false;
                }
            };
            if let Err(err) = hash.verify_signature(&key) {
                warn!(node = %piece.node_id, %err, "piece dropped: bad hash signature");
                return false;
            }
            true
        });
        remote.pieces_hashes_verified = true;
        before - remote.pieces.len()
    }

    /// Validate signed hashes and store the pointer, requiring at least the
    /// optimal share count to survive validation.
    pub fn commit_segment(
        &self,
        path: &SegmentPath,
        mut pointer: Pointer,
        keys: &dyn NodeKeySource,
    ) -> Result<Pointer> {
        if let Some(remote) = pointer.remote_mut() {
            let dropped = Self::filter_valid_pieces(remote, keys);
            if dropped > 0 {
                warn!(%path, dropped, "commit dropped pieces with invalid hashes");
            }
            if (remote.pieces.len() as u16) < remote.redundancy.optimal {
                return Err(Error::invalid(format!(
                    "commit has {} valid pieces, optimal threshold is {}",
                    remote.pieces.len(),
                    remote.redundancy.optimal
                )));
            }
        }
        self.put(path, pointer.clone())?;
        Ok(pointer)
    }

    /// Walk objects and flag those whose intermediate segments are
    /// inconsistent with their last segment (a crashed commit). The sweep
    /// only reports; it never deletes — readers must tolerate the gap until
    /// an operator or a re-upload resolves it.
    pub fn reconcile_objects(&self) -> Vec<SegmentPath> {
        let mut flagged = Vec::new();
        let last_segments: Vec<SegmentPath> = {
            let db = self.db.read();
            db.keys()
                .map(|key| SegmentPath::from_raw(key.clone()))
                .filter(|path| matches!(path.segment(), Ok(SegmentRef::Last)))
                .collect()
        };
        for last in last_segments {
            let mut highest_present: Option<u32> = None;
            let mut gap = false;
            let mut index = 0u32;
            loop {
                let probe = match last.with_segment(SegmentRef::Index(index)) {
                    Ok(probe) => probe,
                    Err(_) => break,
                };
                let present = self.db.read().contains_key(probe.as_bytes());
                if present {
                    if highest_present.map_or(index > 0, |h| index != h + 1) {
                        gap = true;
                    }
                    highest_present = Some(index);
                } else {
                    // probe a little past the first miss to catch holes
                    let mut any_later = false;
                    for later in index + 1..index + 8 {
                        if let Ok(later_path) = last.with_segment(SegmentRef::Index(later)) {
                            if self.db.read().contains_key(later_path.as_bytes()) {
                                any_later = true;
                                break;
                            }
                        }
                    }
                    if any_later {
                        gap = true;
                        index += 1;
                        continue;
                    }
                    break;
                }
                index += 1;
            }
            if gap {
                warn!(path = %last, "object has inconsistent intermediate segments");
                flagged.push(last);
            }
        }
        flagged
    }
}
