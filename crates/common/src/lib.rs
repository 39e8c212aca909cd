//! # Orbit Common
//!
//! Shared vocabulary for the Orbit satellite and storage node: identifiers,
//! Ed25519 identities, order limits and usage receipts, segment pointers,
//! byte-safe segment paths, the shared error taxonomy, and configuration.
//!
//! Everything here is deterministic and side-effect free except key and
//! serial generation, which draw from the OS RNG.

pub mod bloom;
pub mod config;
pub mod error;
pub mod id;
pub mod identity;
pub mod orders;
pub mod path;
pub mod pointer;
pub mod time;

pub use error::{Error, Result};
pub use id::{NodeId, PieceId, SerialNumber};
pub use identity::{Identity, PublicKey, Signature};
pub use orders::{Action, Order, OrderLimit, PieceHash};
pub use path::{SegmentPath, SegmentRef};
pub use pointer::{Pointer, RedundancyScheme, RemotePiece, RemoteSegment, SegmentData};
