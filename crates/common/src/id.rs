//! Core identifiers: `NodeId`, `PieceId`, `SerialNumber`.
//!
//! ## Derivation rules
//!
//! - `NodeId` = SHAKE-256(Ed25519 public key bytes), 32 bytes. Stable for the
//!   lifetime of the key; any party holding the public key can recompute it.
//! - `PieceId` is minted randomly by the satellite once per upload (the root
//!   piece id). The per-node blob key is `root.derive(node_id, piece_num)` =
//!   SHA-256(root || node_id || piece_num le32), so two nodes holding shares
//!   of the same segment store them under unrelated keys.
//! - `SerialNumber` is 16 bytes from the OS RNG; single-use network-wide.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

use crate::error::Error;

// ════════════════════════════════════════════════════════════════════════════
// NODE ID
// ════════════════════════════════════════════════════════════════════════════

/// 32-byte node identifier, equal to SHAKE-256 of the node's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Derive the identifier from raw Ed25519 public key bytes.
    #[must_use]
    pub fn from_public_key_bytes(public_key: &[u8]) -> Self {
        let mut hasher = Shake256::default();
        hasher.update(public_key);
        let mut reader = hasher.finalize_xof();
        let mut out = [0u8; 32];
        reader.read(&mut out);
        NodeId(out)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s).map_err(|e| Error::invalid(format!("node id hex: {}", e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::invalid("node id must be 32 bytes"))?;
        Ok(NodeId(arr))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form keeps log lines readable
        write!(f, "NodeId({}..)", hex::encode(&self.0[..6]))
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeId::from_hex(s)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PIECE ID
// ════════════════════════════════════════════════════════════════════════════

/// 32-byte piece identifier, globally unique per upload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PieceId(pub [u8; 32]);

impl PieceId {
    /// Mint a fresh random root piece id. Satellite-only.
    #[must_use]
    pub fn generate() -> Self {
        let mut out = [0u8; 32];
        OsRng.fill_bytes(&mut out);
        PieceId(out)
    }

    /// Per-node blob key for `piece_num` on `node_id`.
    ///
    /// Deterministic: the satellite, the uplink and the storage node all
    /// recompute the same key from the pointer contents.
    #[must_use]
    pub fn derive(&self, node_id: &NodeId, piece_num: u16) -> Self {
        let mut hasher = Sha256::new();
        Digest::update(&mut hasher, self.0);
        Digest::update(&mut hasher, node_id.0);
        Digest::update(&mut hasher, (piece_num as u32).to_le_bytes());
        PieceId(hasher.finalize().into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s).map_err(|e| Error::invalid(format!("piece id hex: {}", e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::invalid("piece id must be 32 bytes"))?;
        Ok(PieceId(arr))
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({}..)", hex::encode(&self.0[..6]))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SERIAL NUMBER
// ════════════════════════════════════════════════════════════════════════════

/// 16-byte order-limit serial number. Single-use network-wide.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SerialNumber(pub [u8; 16]);

impl SerialNumber {
    /// Mint a fresh serial from the OS RNG.
    ///
    /// Collisions across the satellite's retention window are treated as a
    /// fatal operator-alertable event by the serial table, not here.
    #[must_use]
    pub fn generate() -> Self {
        let mut out = [0u8; 16];
        OsRng.fill_bytes(&mut out);
        SerialNumber(out)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", hex::encode(self.0))
    }
}
