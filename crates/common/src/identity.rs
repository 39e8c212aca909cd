//! Ed25519 identities: keypair wrapper, public keys and detached signatures.
//!
//! Compatible with ed25519-dalek v2 with the rand_core feature enabled.
//!
//! Every principal (satellite, storage node, uplink, repair worker) owns one
//! `Identity`. Its `NodeId` is SHAKE-256 of the public key, so handing out
//! the public key is enough for any peer to both verify signatures and check
//! that the key matches the claimed identity.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::id::NodeId;

/// Raw Ed25519 public key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

/// Detached Ed25519 signature bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..6]))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

impl PublicKey {
    /// The node id this key authenticates.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key_bytes(&self.0)
    }

    /// Verify a detached signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), Error> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|_| Error::unauthenticated("malformed public key"))?;
        let sig_bytes: [u8; 64] = signature
            .0
            .as_slice()
            .try_into()
            .map_err(|_| Error::unauthenticated("signature must be 64 bytes"))?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(message, &sig)
            .map_err(|_| Error::unauthenticated("signature verification failed"))
    }
}

/// A private signing identity.
pub struct Identity {
    signing: SigningKey,
    public: PublicKey,
    node_id: NodeId,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Identity {
    /// Generate a fresh identity from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let signing = SigningKey::generate(&mut rng);
        Self::from_signing_key(signing)
    }

    /// Rebuild an identity from stored secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let sk_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::invalid("secret key must be 32 bytes"))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&sk_bytes)))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = PublicKey(signing.verifying_key().to_bytes());
        let node_id = public.node_id();
        Identity {
            signing,
            public,
            node_id,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Secret key bytes for persistence. Handle with care.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Sign `message`, returning a detached signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let id = Identity::generate();
        let msg = b"orbit order limit";
        let sig = id.sign(msg);
        id.public_key().verify(msg, &sig).expect("verify");

        // tampered message must fail
        assert!(id.public_key().verify(b"orbit order limit!", &sig).is_err());
    }

    #[test]
    fn test_node_id_binds_to_public_key() {
        let id = Identity::generate();
        assert_eq!(id.node_id(), id.public_key().node_id());

        let other = Identity::generate();
        assert_ne!(id.node_id(), other.node_id());
    }

    #[test]
    fn test_secret_bytes_roundtrip() {
        let id = Identity::generate();
        let restored = Identity::from_secret_bytes(&id.secret_bytes()).expect("restore");
        assert_eq!(id.node_id(), restored.node_id());

        let msg = b"same key, same signature semantics";
        restored
            .public_key()
            .verify(msg, &id.sign(msg))
            .expect("cross verify");
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let id = Identity::generate();
        let err = id
            .public_key()
            .verify(b"msg", &Signature(vec![0u8; 10]))
            .unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }
}
