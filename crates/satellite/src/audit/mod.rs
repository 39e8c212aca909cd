//! Audit: stripe sampling and share verification.
//!
//! The audit worker picks a random remote segment, picks a random stripe
//! with the OS RNG (a predictable choice would let a malicious node cache
//! only the stripes it expects to be audited), downloads that stripe's
//! share from every node in the pointer, and classifies each node:
//!
//! - `success` — returned its share and the share survives correction
//! - `fail`    — share missing or altered
//! - `offline` — never answered the dial
//! - `contained` — answered the dial but the outcome is ambiguous (stalled
//!   transfer, unknown error); a [`PendingAudit`] freezes the expected share
//!   hash so a later reverify can resolve the ambiguity
//!
//! The reporter feeds the resulting [`Report`] into the overlay's
//! reputation counters.

pub mod containment;
pub mod reporter;
pub mod verifier;

pub use containment::Containment;
pub use reporter::Reporter;
pub use verifier::Verifier;

use std::sync::Arc;

use tracing::{debug, warn};

use orbit_common::error::Result;
use orbit_common::id::{NodeId, PieceId};
use orbit_common::path::SegmentPath;

/// The follow-up obligation for a node whose audit was inconclusive.
///
/// At most one pending audit exists per node; a newer inconclusive audit
/// replaces the older one — the most recent failure supersedes, by
/// contract, not as a side effect of map semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAudit {
    pub node_id: NodeId,
    /// Root piece id of the segment the node was audited against.
    pub piece_id: PieceId,
    pub stripe_index: u64,
    pub share_size: u32,
    /// SHA-256 of the share the node should have returned.
    pub expected_share_hash: [u8; 32],
    pub path: SegmentPath,
}

/// Outcome of one audit pass over one segment.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub successes: Vec<NodeId>,
    pub fails: Vec<NodeId>,
    pub offlines: Vec<NodeId>,
    pub pending_audits: Vec<PendingAudit>,
}

impl Report {
    #[must_use]
    pub fn total_classified(&self) -> usize {
        self.successes.len() + self.fails.len() + self.offlines.len() + self.pending_audits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_classified() == 0
    }

    fn merge(&mut self, other: Report) {
        self.successes.extend(other.successes);
        self.fails.extend(other.fails);
        self.offlines.extend(other.offlines);
        self.pending_audits.extend(other.pending_audits);
    }
}

/// The audit worker loop body: pick a random segment, resolve its contained
/// nodes first, then audit a fresh stripe, and apply the merged report.
pub struct AuditChore {
    metainfo: Arc<crate::metainfo::Service>,
    verifier: Arc<Verifier>,
    reporter: Arc<Reporter>,
}

impl AuditChore {
    #[must_use]
    pub fn new(
        metainfo: Arc<crate::metainfo::Service>,
        verifier: Arc<Verifier>,
        reporter: Arc<Reporter>,
    ) -> Self {
        AuditChore {
            metainfo,
            verifier,
            reporter,
        }
    }

    /// One audit cycle. Returns the applied report, or `None` when there was
    /// nothing to audit or the sample was voided by a concurrent write.
    pub async fn run_once(&self) -> Result<Option<Report>> {
        let path = match self.metainfo.random_remote_path() {
            Some(path) => path,
            None => return Ok(None),
        };

        let mut report = match self.verifier.reverify(&path).await {
            Ok(report) => report,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        match self.verifier.verify(&path).await {
            Ok(fresh) => report.merge(fresh),
            Err(err) if err.is_not_found() || err.is_transient() => {
                // deleted or altered mid-audit: neither success nor failure
                debug!(%path, %err, "audit sample voided");
            }
            Err(err) => {
                warn!(%path, %err, "audit failed");
                return Err(err);
            }
        }

        if report.is_empty() {
            return Ok(None);
        }
        self.reporter.record(&report)?;
        Ok(Some(report))
    }
}
