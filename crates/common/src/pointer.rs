//! Segment pointers and redundancy schemes.
//!
//! A `Pointer` is the satellite's authoritative record for one segment:
//! either a tiny inline payload or a remote segment naming the `n` storage
//! nodes holding its erasure shares.
//!
//! ## Invariants
//!
//! - `required <= repair <= optimal <= total`, `total <= 256` (GF(2^8))
//! - piece numbers are unique within a pointer and `< total`
//! - node ids are unique within a pointer
//! - `pieces_hashes_verified` is set once by the satellite and never reset

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::id::{NodeId, PieceId};
use crate::orders::PieceHash;

// ════════════════════════════════════════════════════════════════════════════
// REDUNDANCY
// ════════════════════════════════════════════════════════════════════════════

/// Erasure-code parameters for a remote segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyScheme {
    /// k: minimum shares needed to reconstruct a stripe.
    pub required: u16,
    /// m: repair is triggered at or below this many healthy shares.
    pub repair: u16,
    /// o: an upload or repair is complete at this many shares.
    pub optimal: u16,
    /// n: total shares produced per stripe.
    pub total: u16,
    /// Bytes per erasure share within one stripe.
    pub share_size: u32,
}

impl RedundancyScheme {
    pub fn validate(&self) -> Result<(), Error> {
        if self.required == 0 || self.share_size == 0 {
            return Err(Error::invalid("redundancy: k and share size must be nonzero"));
        }
        if !(self.required <= self.repair && self.repair <= self.optimal && self.optimal <= self.total)
        {
            return Err(Error::invalid("redundancy: need k <= m <= o <= n"));
        }
        if self.total > 256 {
            return Err(Error::invalid("redundancy: total shares exceed GF(2^8)"));
        }
        Ok(())
    }

    /// Bytes of plaintext per stripe: k * share_size.
    #[must_use]
    pub fn stripe_size(&self) -> u64 {
        self.required as u64 * self.share_size as u64
    }

    /// Number of stripes covering `segment_size` bytes, counting a short
    /// final stripe.
    #[must_use]
    pub fn stripe_count(&self, segment_size: u64) -> u64 {
        let stripe = self.stripe_size();
        if stripe == 0 {
            return 0;
        }
        segment_size.div_ceil(stripe)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// POINTER
// ════════════════════════════════════════════════════════════════════════════

/// One share's placement: which node holds piece number `piece_num`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePiece {
    pub piece_num: u16,
    pub node_id: NodeId,
    /// Storage-node-signed hash collected at commit or repair; optional for
    /// pointers committed before hash verification existed.
    pub hash: Option<PieceHash>,
}

/// Remote-segment body of a pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSegment {
    pub redundancy: RedundancyScheme,
    pub root_piece_id: PieceId,
    pub pieces: Vec<RemotePiece>,
    /// Set once `filter_valid_pieces` confirmed the signed hashes; never reset.
    pub pieces_hashes_verified: bool,
}

/// Inline or remote payload of a pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentData {
    Inline(Vec<u8>),
    Remote(RemoteSegment),
}

/// The satellite's authoritative record for one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    pub data: SegmentData,
    pub segment_size: u64,
    pub creation_ms: u64,
    pub expiration_ms: Option<u64>,
    /// Opaque client metadata (stream info on the last segment).
    pub metadata: Vec<u8>,
}

impl Pointer {
    #[must_use]
    pub fn new_inline(payload: Vec<u8>, creation_ms: u64) -> Self {
        let segment_size = payload.len() as u64;
        Pointer {
            data: SegmentData::Inline(payload),
            segment_size,
            creation_ms,
            expiration_ms: None,
            metadata: Vec::new(),
        }
    }

    #[must_use]
    pub fn new_remote(remote: RemoteSegment, segment_size: u64, creation_ms: u64) -> Self {
        Pointer {
            data: SegmentData::Remote(remote),
            segment_size,
            creation_ms,
            expiration_ms: None,
            metadata: Vec::new(),
        }
    }

    #[must_use]
    pub fn remote(&self) -> Option<&RemoteSegment> {
        match &self.data {
            SegmentData::Remote(r) => Some(r),
            SegmentData::Inline(_) => None,
        }
    }

    #[must_use]
    pub fn remote_mut(&mut self) -> Option<&mut RemoteSegment> {
        match &mut self.data {
            SegmentData::Remote(r) => Some(r),
            SegmentData::Inline(_) => None,
        }
    }

    /// Check the pointer invariants. Run on every store write.
    pub fn validate(&self) -> Result<(), Error> {
        let remote = match self.remote() {
            Some(r) => r,
            None => return Ok(()),
        };
        remote.redundancy.validate()?;

        let mut nums = std::collections::HashSet::new();
        let mut nodes = std::collections::HashSet::new();
        for piece in &remote.pieces {
            if piece.piece_num >= remote.redundancy.total {
                return Err(Error::corrupt(format!(
                    "piece num {} out of range (total {})",
                    piece.piece_num, remote.redundancy.total
                )));
            }
            if !nums.insert(piece.piece_num) {
                return Err(Error::corrupt(format!(
                    "duplicate piece num {} in pointer",
                    piece.piece_num
                )));
            }
            if !nodes.insert(piece.node_id) {
                return Err(Error::corrupt(format!(
                    "duplicate node {} in pointer",
                    piece.node_id
                )));
            }
        }
        Ok(())
    }

    /// True once the wall clock has passed the pointer's expiration.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expiration_ms, Some(exp) if now_ms > exp)
    }
}

impl RemoteSegment {
    /// Piece numbers in `[0, total)` with no current piece.
    #[must_use]
    pub fn missing_piece_nums(&self) -> Vec<u16> {
        let held: std::collections::HashSet<u16> =
            self.pieces.iter().map(|p| p.piece_num).collect();
        (0..self.redundancy.total).filter(|n| !held.contains(n)).collect()
    }

    #[must_use]
    pub fn piece_for_node(&self, node_id: &NodeId) -> Option<&RemotePiece> {
        self.pieces.iter().find(|p| &p.node_id == node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> RedundancyScheme {
        RedundancyScheme {
            required: 2,
            repair: 2,
            optimal: 3,
            total: 4,
            share_size: 256,
        }
    }

    fn node(b: u8) -> NodeId {
        NodeId::from_public_key_bytes(&[b; 32])
    }

    fn remote_with(pieces: Vec<RemotePiece>) -> Pointer {
        Pointer::new_remote(
            RemoteSegment {
                redundancy: scheme(),
                root_piece_id: PieceId::generate(),
                pieces,
                pieces_hashes_verified: false,
            },
            512,
            1,
        )
    }

    #[test]
    fn test_redundancy_validate() {
        assert!(scheme().validate().is_ok());

        let mut bad = scheme();
        bad.repair = 1; // m < k
        assert!(bad.validate().is_err());

        let mut huge = scheme();
        huge.total = 300;
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_stripe_math() {
        let s = scheme();
        assert_eq!(s.stripe_size(), 512);
        assert_eq!(s.stripe_count(512), 1);
        assert_eq!(s.stripe_count(513), 2);
        assert_eq!(s.stripe_count(1024), 2);
    }

    #[test]
    fn test_pointer_rejects_duplicate_piece_num() {
        let p = remote_with(vec![
            RemotePiece { piece_num: 0, node_id: node(1), hash: None },
            RemotePiece { piece_num: 0, node_id: node(2), hash: None },
        ]);
        assert!(matches!(p.validate(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_pointer_rejects_duplicate_node() {
        let p = remote_with(vec![
            RemotePiece { piece_num: 0, node_id: node(1), hash: None },
            RemotePiece { piece_num: 1, node_id: node(1), hash: None },
        ]);
        assert!(matches!(p.validate(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_pointer_rejects_out_of_range_piece_num() {
        let p = remote_with(vec![RemotePiece { piece_num: 4, node_id: node(1), hash: None }]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_missing_piece_nums() {
        let p = remote_with(vec![
            RemotePiece { piece_num: 1, node_id: node(1), hash: None },
            RemotePiece { piece_num: 3, node_id: node(2), hash: None },
        ]);
        assert_eq!(p.remote().unwrap().missing_piece_nums(), vec![0, 2]);
    }

    #[test]
    fn test_inline_pointer_always_valid() {
        let p = Pointer::new_inline(vec![1, 2, 3], 7);
        assert!(p.validate().is_ok());
        assert_eq!(p.segment_size, 3);
        assert!(p.remote().is_none());
    }

    #[test]
    fn test_expiration() {
        let mut p = Pointer::new_inline(vec![], 0);
        assert!(!p.is_expired(u64::MAX));
        p.expiration_ms = Some(100);
        assert!(!p.is_expired(100));
        assert!(p.is_expired(101));
    }
}
