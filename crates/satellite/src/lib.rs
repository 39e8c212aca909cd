//! # Orbit Satellite
//!
//! The trusted coordinator role: it knows where every segment's pieces live,
//! mints the order limits that authorize every byte of traffic, samples
//! stripes to catch nodes that lost or altered data, and restores redundancy
//! when too many pieces go missing.
//!
//! Subsystems:
//!
//! - [`metainfo`] — the byte-safe pointer store mapping segment paths to
//!   piece placements, with compare-and-swap piece updates.
//! - [`overlay`] — per-node dossiers (address, capacity, reputation),
//!   weighted-random node selection, disqualification.
//! - [`orders`] — order-limit issuance, receipt settlement with serial
//!   dedup, archival, and the hourly bandwidth rollup.
//! - [`audit`] — stripe sampling, share verification, containment of nodes
//!   with inconclusive outcomes, and reputation reporting.
//! - [`repair`] — the injury checker, the leased repair queue, and the
//!   worker that reconstructs and re-places lost pieces.
//! - [`gc`] — the retain-filter sender that lets storage nodes reconcile
//!   their blob sets against the pointer store.
//! - [`tally`] — pointer-derived storage totals and the consistency check
//!   against settled upload receipts.
//! - [`transport`] — the dialer used by audit and repair to reach storage
//!   nodes, with errors classified for the audit outcome table.

pub mod audit;
pub mod gc;
pub mod metainfo;
pub mod orders;
pub mod overlay;
pub mod peer;
pub mod repair;
pub mod tally;
pub mod transport;

pub use peer::Satellite;
pub use transport::{PieceTransport, RemoteTransport, TransportError};
