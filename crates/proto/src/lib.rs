//! Wire protocol for the piecestore data plane.
//!
//! Messages are bincode-encoded and framed with a u32 big-endian length
//! prefix. Encoding is deterministic: the same message always produces the
//! same bytes, which matters because retain requests are signed over their
//! encoded form.
//!
//! The deployment wire runs these frames over mutually-authenticated TLS
//! where the peer certificate chain binds the connection to a `NodeId`; the
//! frame layer itself is transport-agnostic and the integration suite runs
//! it over plain TCP on loopback.

pub mod frame;
pub mod messages;

pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_BYTES};
pub use messages::{
    ErrorClass, GcSummary, PieceRequest, PieceResponse, RetainRequest, SettlementItem,
    SignedRetain,
};
