//! The self-describing piece header.
//!
//! Format v1 and later reserve the first 512 bytes of every piece file for a
//! framed header: a u16 big-endian length followed by the bincode-encoded
//! [`PieceHeader`], zero-padded to the reserved size. Any party holding the
//! piece file and the satellite's public key can verify that this node
//! accepted the piece under a legitimate PUT: the header carries the order
//! limit and the uplink's signed piece hash.
//!
//! Format v0 predates the embedded header; its header fields live in a
//! side table (see [`super::legacy`]) and the piece file is bare payload.
//! v0 is read-only: new pieces are always written as v1.

use serde::{Deserialize, Serialize};

use orbit_common::error::{Error, Result};
use orbit_common::orders::{OrderLimit, PieceHash};

/// Bytes reserved at the front of every v1+ piece file.
pub const HEADER_RESERVED: usize = 512;

/// Current header format version.
pub const FORMAT_V1: u16 = 1;

/// Hash algorithm used over the piece payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceHeader {
    pub format_version: u16,
    pub hash_algorithm: HashAlgorithm,
    pub creation_ms: u64,
    /// The uplink's signed commitment to the payload.
    pub uplink_hash: PieceHash,
    /// The order limit the piece arrived under.
    pub order_limit: OrderLimit,
}

impl PieceHeader {
    /// SHA-256 of the payload as recorded at commit.
    #[must_use]
    pub fn payload_hash(&self) -> &[u8; 32] {
        &self.uplink_hash.hash
    }

    /// Encode into the fixed reserved region.
    pub fn to_reserved_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| Error::internal(format!("header encode: {}", e)))?;
        if body.len() > HEADER_RESERVED - 2 {
            return Err(Error::corrupt(format!(
                "piece header {} bytes exceeds reserved region",
                body.len()
            )));
        }
        let mut out = vec![0u8; HEADER_RESERVED];
        out[..2].copy_from_slice(&(body.len() as u16).to_be_bytes());
        out[2..2 + body.len()].copy_from_slice(&body);
        Ok(out)
    }

    /// Decode from the reserved region. Fails with `Integrity` on any
    /// malformed framing so callers can quarantine torn files.
    pub fn from_reserved_bytes(bytes: &[u8]) -> Result<PieceHeader> {
        if bytes.len() < HEADER_RESERVED {
            return Err(Error::integrity("piece file shorter than header region"));
        }
        let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if len == 0 || len > HEADER_RESERVED - 2 {
            return Err(Error::integrity(format!("bad header frame length {}", len)));
        }
        let header: PieceHeader = bincode::deserialize(&bytes[2..2 + len])
            .map_err(|e| Error::integrity(format!("header decode: {}", e)))?;
        if header.format_version == 0 || header.format_version > FORMAT_V1 {
            return Err(Error::integrity(format!(
                "unsupported header format {}",
                header.format_version
            )));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_common::id::{NodeId, PieceId};
    use orbit_common::identity::Identity;
    use orbit_common::orders::{sign_order_limit, Action};

    fn sample_header() -> PieceHeader {
        let satellite = Identity::generate();
        let uplink = Identity::generate();
        let piece_id = PieceId::generate();
        let limit = sign_order_limit(
            &satellite,
            uplink.node_id(),
            uplink.public_key(),
            NodeId::from_public_key_bytes(&[1u8; 32]),
            piece_id,
            Action::Put,
            4096,
            Some(1_800_000_000_000),
            1_700_000_000_000,
        );
        let uplink_hash = PieceHash::sign(&uplink, piece_id, [9u8; 32], 4096, 1_699_999_000_000);
        PieceHeader {
            format_version: FORMAT_V1,
            hash_algorithm: HashAlgorithm::Sha256,
            creation_ms: 1_700_000_000_123,
            uplink_hash,
            order_limit: limit,
        }
    }

    #[test]
    fn test_header_fits_reserved_region() {
        let bytes = sample_header().to_reserved_bytes().expect("encode");
        assert_eq!(bytes.len(), HEADER_RESERVED);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = header.to_reserved_bytes().expect("encode");
        let back = PieceHeader::from_reserved_bytes(&bytes).expect("decode");
        assert_eq!(header, back);
    }

    #[test]
    fn test_torn_header_is_integrity_error() {
        let mut bytes = sample_header().to_reserved_bytes().expect("encode");
        bytes[2] ^= 0xff;
        assert!(matches!(
            PieceHeader::from_reserved_bytes(&bytes),
            Err(Error::Integrity(_))
        ));

        // zeroed region (crash before header landed)
        let zeros = vec![0u8; HEADER_RESERVED];
        assert!(matches!(
            PieceHeader::from_reserved_bytes(&zeros),
            Err(Error::Integrity(_))
        ));

        // short file
        assert!(matches!(
            PieceHeader::from_reserved_bytes(&[1, 2, 3]),
            Err(Error::Integrity(_))
        ));
    }
}
