//! Piecestore request/response messages.
//!
//! Every data-plane request carries the signed order limit that authorizes
//! it; the storage node re-verifies the limit before touching disk, so the
//! transport does not need to be trusted. The one exception is `Retain`,
//! which is not an order-limit operation: it carries its own satellite
//! signature over the encoded request body.

use serde::{Deserialize, Serialize};

use orbit_common::bloom::BloomFilter;
use orbit_common::error::Error;
use orbit_common::id::NodeId;
use orbit_common::identity::{Identity, PublicKey, Signature};
use orbit_common::orders::{Order, OrderLimit, PieceHash};

// ════════════════════════════════════════════════════════════════════════════
// RETAIN (GARBAGE COLLECTION)
// ════════════════════════════════════════════════════════════════════════════

/// Keep pieces in the filter or newer than the watermark; the rest is
/// garbage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainRequest {
    pub filter: BloomFilter,
    /// Snapshot watermark (ms). Pieces created after it are always kept.
    pub created_before_ms: u64,
}

/// A retain request bound to its issuing satellite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRetain {
    pub satellite_id: NodeId,
    pub request: RetainRequest,
    pub signature: Signature,
}

impl SignedRetain {
    fn signable_bytes(request: &RetainRequest) -> Result<Vec<u8>, Error> {
        bincode::serialize(request).map_err(|e| Error::internal(format!("retain encode: {}", e)))
    }

    pub fn sign(satellite: &Identity, request: RetainRequest) -> Result<SignedRetain, Error> {
        let signature = satellite.sign(&Self::signable_bytes(&request)?);
        Ok(SignedRetain {
            satellite_id: satellite.node_id(),
            request,
            signature,
        })
    }

    pub fn verify(&self, satellite_key: &PublicKey) -> Result<(), Error> {
        if satellite_key.node_id() != self.satellite_id {
            return Err(Error::unauthenticated("retain signer does not match satellite id"));
        }
        satellite_key.verify(&Self::signable_bytes(&self.request)?, &self.signature)
    }
}

/// Outcome of one retain or expiry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcSummary {
    pub checked: usize,
    pub deleted: usize,
    pub reclaimed_bytes: u64,
    /// Pieces that could not be examined (quarantined or unreadable).
    pub failed: usize,
}

// ════════════════════════════════════════════════════════════════════════════
// REQUEST / RESPONSE
// ════════════════════════════════════════════════════════════════════════════

// ════════════════════════════════════════════════════════════════════════════
// SETTLEMENT
// ════════════════════════════════════════════════════════════════════════════

/// One receipt a storage node submits for settlement: the satellite-signed
/// limit plus the countersigned order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementItem {
    pub limit: OrderLimit,
    pub order: Order,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PieceRequest {
    Upload {
        limit: OrderLimit,
        uplink_hash: PieceHash,
        payload: Vec<u8>,
        order: Order,
    },
    Download {
        limit: OrderLimit,
        order: Order,
        offset: u64,
        length: u64,
    },
    Delete {
        limit: OrderLimit,
        strict: bool,
    },
    Retain(SignedRetain),
}

/// Stable error classes crossing the wire. Internal detail never leaves the
/// node; the satellite classifies audit outcomes from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    Invalid,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    ResourceExhausted,
    Unavailable,
    Integrity,
    Internal,
}

impl ErrorClass {
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Invalid(_) => ErrorClass::Invalid,
            Error::Unauthenticated(_) => ErrorClass::Unauthenticated,
            Error::PermissionDenied(_) => ErrorClass::PermissionDenied,
            Error::NotFound(_) => ErrorClass::NotFound,
            Error::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            Error::Unavailable(_) => ErrorClass::Unavailable,
            Error::Integrity(_) => ErrorClass::Integrity,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorClass::NotFound,
            Error::Corrupt(_) | Error::Internal(_) | Error::Io(_) => ErrorClass::Internal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PieceResponse {
    Uploaded(PieceHash),
    Data(Vec<u8>),
    Deleted(bool),
    Retained(GcSummary),
    /// `class` plus a short human-readable message; never internal state.
    Error { class: ErrorClass, message: String },
}

impl PieceResponse {
    /// Map an internal error into its wire form.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        PieceResponse::Error {
            class: ErrorClass::from_error(err),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_retain_roundtrip() {
        let satellite = Identity::generate();
        let mut filter = BloomFilter::new(10, 1e-4);
        filter.add(&[5u8; 32]);
        let signed = SignedRetain::sign(
            &satellite,
            RetainRequest {
                filter,
                created_before_ms: 12345,
            },
        )
        .expect("sign");

        signed.verify(&satellite.public_key()).expect("verify");

        let stranger = Identity::generate();
        assert!(signed.verify(&stranger.public_key()).is_err());
    }

    #[test]
    fn test_tampered_retain_rejected() {
        let satellite = Identity::generate();
        let mut signed = SignedRetain::sign(
            &satellite,
            RetainRequest {
                filter: BloomFilter::new(10, 1e-4),
                created_before_ms: 1,
            },
        )
        .expect("sign");
        signed.request.created_before_ms = u64::MAX; // widen the delete window
        assert!(signed.verify(&satellite.public_key()).is_err());
    }

    #[test]
    fn test_error_class_mapping() {
        assert_eq!(
            ErrorClass::from_error(&Error::not_found("piece")),
            ErrorClass::NotFound
        );
        assert_eq!(
            ErrorClass::from_error(&Error::corrupt("dup serial")),
            ErrorClass::Internal
        );
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(ErrorClass::from_error(&io), ErrorClass::NotFound);
    }

    #[test]
    fn test_request_encoding_is_deterministic() {
        let satellite = Identity::generate();
        let request = RetainRequest {
            filter: BloomFilter::new(100, 1e-4),
            created_before_ms: 777,
        };
        let a = SignedRetain::sign(&satellite, request.clone()).expect("sign a");
        let b = SignedRetain::sign(&satellite, request).expect("sign b");
        // same body, same signature: encoding cannot drift between calls
        assert_eq!(a.signature, b.signature);
    }
}
