//! Order limits, usage receipts and piece hashes.
//!
//! An `OrderLimit` is the satellite-signed capability that authorizes one
//! bounded bandwidth transaction against one piece on one storage node. The
//! storage node records an `Order` (the countersigned actual byte count) and
//! later settles it with the issuing satellite. A `PieceHash` is the signed
//! commitment to a piece's content exchanged at upload commit.
//!
//! ## Signable encodings (consensus-critical)
//!
//! Signatures cover an explicit field concatenation, not a serde encoding,
//! so the signed bytes cannot drift with serializer versions:
//!
//! `OrderLimit`: serial(16) || satellite_id(32) || uplink_id(32) ||
//!   storage_id(32) || piece_id(32) || uplink_public_key(32) || action(1) ||
//!   limit(8 be) || piece_expiration(8 be, 0 when none) ||
//!   order_expiration(8 be)
//!
//! `Order`: serial(16) || amount(8 be)
//!
//! `PieceHash`: piece_id(32) || hash(32) || piece_size(8 be) || timestamp(8 be)

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::id::{NodeId, PieceId, SerialNumber};
use crate::identity::{Identity, PublicKey, Signature};

// ════════════════════════════════════════════════════════════════════════════
// ACTION
// ════════════════════════════════════════════════════════════════════════════

/// The bandwidth action an order limit authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Put,
    Get,
    GetAudit,
    GetRepair,
    PutRepair,
    Delete,
}

impl Action {
    #[must_use]
    #[inline]
    pub const fn as_u8(self) -> u8 {
        match self {
            Action::Put => 1,
            Action::Get => 2,
            Action::GetAudit => 3,
            Action::GetRepair => 4,
            Action::PutRepair => 5,
            Action::Delete => 6,
        }
    }

    /// True for actions that move piece bytes from node to caller.
    #[must_use]
    pub fn is_download(self) -> bool {
        matches!(self, Action::Get | Action::GetAudit | Action::GetRepair)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Put => "put",
            Action::Get => "get",
            Action::GetAudit => "get_audit",
            Action::GetRepair => "get_repair",
            Action::PutRepair => "put_repair",
            Action::Delete => "delete",
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ORDER LIMIT
// ════════════════════════════════════════════════════════════════════════════

/// Satellite-signed authorization for at most `limit` bytes of `action`
/// against `piece_id` on `storage_id`, valid until `order_expiration_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLimit {
    pub serial: SerialNumber,
    pub satellite_id: NodeId,
    /// The principal allowed to move bytes under this limit: the uplink for
    /// client actions, the satellite's own worker for audit and repair.
    pub uplink_id: NodeId,
    pub storage_id: NodeId,
    pub piece_id: PieceId,
    /// Public key of `uplink_id`, carried so the storage node can verify the
    /// uplink's piece hash and order countersignatures without a directory
    /// lookup. Bound to the limit by the satellite signature.
    pub uplink_public_key: PublicKey,
    pub action: Action,
    pub limit: u64,
    /// When set, the piece itself expires and may be reclaimed.
    pub piece_expiration_ms: Option<u64>,
    pub order_expiration_ms: u64,
    pub satellite_signature: Signature,
}

impl OrderLimit {
    /// The exact bytes the satellite signs.
    #[must_use]
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 32 * 5 + 1 + 8 * 3);
        out.extend_from_slice(&self.serial.0);
        out.extend_from_slice(&self.satellite_id.0);
        out.extend_from_slice(&self.uplink_id.0);
        out.extend_from_slice(&self.storage_id.0);
        out.extend_from_slice(&self.piece_id.0);
        out.extend_from_slice(&self.uplink_public_key.0);
        out.push(self.action.as_u8());
        out.extend_from_slice(&self.limit.to_be_bytes());
        out.extend_from_slice(&self.piece_expiration_ms.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&self.order_expiration_ms.to_be_bytes());
        out
    }

    /// Verify the satellite signature against the issuer's public key.
    ///
    /// The caller is responsible for checking that `satellite_public_key`
    /// belongs to a trusted satellite and that its node id matches
    /// `self.satellite_id`.
    pub fn verify_signature(&self, satellite_public_key: &PublicKey) -> Result<(), Error> {
        if satellite_public_key.node_id() != self.satellite_id {
            return Err(Error::unauthenticated(
                "satellite public key does not match satellite id in limit",
            ));
        }
        satellite_public_key.verify(&self.signable_bytes(), &self.satellite_signature)
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.order_expiration_ms
    }
}

/// Build and sign an order limit. Satellite-only.
#[allow(clippy::too_many_arguments)]
pub fn sign_order_limit(
    satellite: &Identity,
    uplink_id: NodeId,
    uplink_public_key: PublicKey,
    storage_id: NodeId,
    piece_id: PieceId,
    action: Action,
    limit: u64,
    piece_expiration_ms: Option<u64>,
    order_expiration_ms: u64,
) -> OrderLimit {
    let mut order_limit = OrderLimit {
        serial: SerialNumber::generate(),
        satellite_id: satellite.node_id(),
        uplink_id,
        storage_id,
        piece_id,
        uplink_public_key,
        action,
        limit,
        piece_expiration_ms,
        order_expiration_ms,
        satellite_signature: Signature(Vec::new()),
    };
    order_limit.satellite_signature = satellite.sign(&order_limit.signable_bytes());
    order_limit
}

// ════════════════════════════════════════════════════════════════════════════
// ORDER (RECEIPT)
// ════════════════════════════════════════════════════════════════════════════

/// The countersigned acknowledgement that `amount` bytes moved under the
/// order limit with the same serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub serial: SerialNumber,
    pub amount: u64,
    /// Uplink signature for client actions, worker signature for audit and
    /// repair actions.
    pub uplink_signature: Signature,
}

impl Order {
    #[must_use]
    pub fn signable_bytes(serial: &SerialNumber, amount: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 8);
        out.extend_from_slice(&serial.0);
        out.extend_from_slice(&amount.to_be_bytes());
        out
    }

    /// Build and sign a receipt for `amount` bytes under `limit`.
    #[must_use]
    pub fn sign(signer: &Identity, limit: &OrderLimit, amount: u64) -> Order {
        Order {
            serial: limit.serial,
            amount,
            uplink_signature: signer.sign(&Self::signable_bytes(&limit.serial, amount)),
        }
    }

    pub fn verify_signature(&self, signer_public_key: &PublicKey) -> Result<(), Error> {
        signer_public_key.verify(
            &Self::signable_bytes(&self.serial, self.amount),
            &self.uplink_signature,
        )
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PIECE HASH
// ════════════════════════════════════════════════════════════════════════════

/// Signed commitment to a piece's content.
///
/// The uplink signs one at upload time; the storage node countersigns its own
/// at commit. The satellite validates the uplink form before accepting a
/// pointer (`filter_valid_pieces`), and the repair worker validates node
/// forms exactly the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceHash {
    pub piece_id: PieceId,
    /// SHA-256 of the piece payload.
    pub hash: [u8; 32],
    pub piece_size: u64,
    pub timestamp_ms: u64,
    pub signature: Signature,
}

impl PieceHash {
    #[must_use]
    pub fn signable_bytes(piece_id: &PieceId, hash: &[u8; 32], piece_size: u64, timestamp_ms: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 32 + 8 + 8);
        out.extend_from_slice(&piece_id.0);
        out.extend_from_slice(hash);
        out.extend_from_slice(&piece_size.to_be_bytes());
        out.extend_from_slice(&timestamp_ms.to_be_bytes());
        out
    }

    /// Build and sign a piece hash.
    #[must_use]
    pub fn sign(
        signer: &Identity,
        piece_id: PieceId,
        hash: [u8; 32],
        piece_size: u64,
        timestamp_ms: u64,
    ) -> PieceHash {
        PieceHash {
            piece_id,
            hash,
            piece_size,
            timestamp_ms,
            signature: signer.sign(&Self::signable_bytes(&piece_id, &hash, piece_size, timestamp_ms)),
        }
    }

    pub fn verify_signature(&self, signer_public_key: &PublicKey) -> Result<(), Error> {
        signer_public_key.verify(
            &Self::signable_bytes(&self.piece_id, &self.hash, self.piece_size, self.timestamp_ms),
            &self.signature,
        )
    }
}
