//! # Orbit Storage Node
//!
//! The untrusted data-holding role. A node persists opaque erasure-share
//! pieces for one or more satellites, enforces the signed order limits that
//! authorize every byte moved, countersigns usage receipts, settles them with
//! the issuing satellite, and reconciles its blob set against
//! satellite-supplied retain filters.
//!
//! Layering, bottom up:
//!
//! - [`pieces`] — hash-verified piece files over the blob store, with the
//!   self-describing piece header and per-piece locking.
//! - [`monitor`] — allocated-disk accounting; writes fail with
//!   `ResourceExhausted` rather than overrun the operator's budget.
//! - [`trust`] — the satellite whitelist; order limits from unknown
//!   satellites are rejected with `PermissionDenied`.
//! - [`orders`] — order-limit verification, the single-use serial set, and
//!   the settlement agent that streams receipts back to satellites.
//! - [`endpoint`] — the piecestore surface (upload / download / delete /
//!   retain) that ties the above together.
//! - [`server`] — the framed TCP loop exposing the endpoint to the network.
//! - [`gc`] — retain-filter reconciliation and TTL expiry.

pub mod endpoint;
pub mod gc;
pub mod monitor;
pub mod orders;
pub mod pieces;
pub mod server;
pub mod trust;

pub use endpoint::NodeEndpoint;
pub use gc::RetainRequest;
pub use monitor::CapacityMonitor;
pub use pieces::{PieceReader, PieceStore, PieceWriter};
pub use trust::TrustedSatellites;
