//! Repair: detection, queueing and reconstruction of injured segments.
//!
//! The [`checker`] sweeps pointers and enqueues segments whose healthy-piece
//! count has fallen to the repair threshold; the [`queue`] orders them by
//! severity under per-segment leases; the [`repairer`] reconstructs lost
//! pieces from survivors and rewrites the pointer with a compare-and-swap.

pub mod checker;
pub mod queue;
pub mod repairer;

pub use checker::{Checker, CheckerStats};
pub use queue::{InjuredSegment, RepairQueue};
pub use repairer::{RepairOutcome, RepairWorker, SegmentRepairer};
