//! Applying audit reports to reputation.
//!
//! Reports are delivered at-least-once-then-checkpointed: `record` applies
//! everything it can, retries the remainder a bounded number of times, and
//! only returns `Ok` once every entry has been applied. The caller must not
//! re-submit an acknowledged report — re-delivery double-counts by design
//! (idempotency is at report granularity, not entry granularity).

use std::sync::Arc;

use tracing::{debug, warn};

use orbit_common::error::{Error, Result};
use orbit_common::time::now_ms;

use crate::audit::containment::Containment;
use crate::audit::Report;
use crate::overlay::{AuditOutcome, OverlayService};

pub struct Reporter {
    overlay: Arc<OverlayService>,
    containment: Arc<Containment>,
    max_retries: u32,
}

impl Reporter {
    #[must_use]
    pub fn new(overlay: Arc<OverlayService>, containment: Arc<Containment>, max_retries: u32) -> Self {
        Reporter {
            overlay,
            containment,
            max_retries,
        }
    }

    /// Apply a report to the overlay. Remaining entries are retried; if any
    /// still fail after the retry budget the error carries the count and the
    /// caller decides whether to re-deliver the remainder.
    pub fn record(&self, report: &Report) -> Result<()> {
        let mut remaining = report.clone();
        let mut attempt = 0;
        loop {
            remaining = self.apply(&remaining);
            if remaining.is_empty() {
                return Ok(());
            }
            attempt += 1;
            if attempt > self.max_retries {
                return Err(Error::internal(format!(
                    "report not fully applied: {} entries left after {} attempts",
                    remaining.total_classified(),
                    attempt
                )));
            }
            warn!(left = remaining.total_classified(), attempt, "retrying report application");
        }
    }

    /// One application pass; returns whatever failed.
    fn apply(&self, report: &Report) -> Report {
        let mut failed = Report::default();
        for node in &report.successes {
            if self.overlay.apply_audit(node, AuditOutcome::Success).is_err() {
                failed.successes.push(*node);
            }
        }
        for node in &report.fails {
            if self.overlay.apply_audit(node, AuditOutcome::Fail).is_err() {
                failed.fails.push(*node);
            }
        }
        for node in &report.offlines {
            if self.overlay.apply_audit(node, AuditOutcome::Offline).is_err() {
                failed.offlines.push(*node);
            }
        }
        // pending audits were already inserted by the verifier; nothing to
        // re-apply here, but keep the contract visible
        debug!(
            successes = report.successes.len(),
            fails = report.fails.len(),
            offlines = report.offlines.len(),
            "report applied"
        );
        failed
    }

    /// Convert aged-out containment entries into offline tallies.
    pub fn age_out_containment(&self) -> usize {
        let aged = self.containment.age_out(now_ms());
        for pending in &aged {
            if let Err(err) = self.overlay.apply_audit(&pending.node_id, AuditOutcome::Offline) {
                warn!(node = %pending.node_id, %err, "aged-out containment tally failed");
            }
        }
        aged.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_common::config::NodeSelectionConfig;
    use orbit_common::id::NodeId;
    use orbit_common::identity::Identity;

    fn setup() -> (Arc<OverlayService>, Arc<Containment>, Reporter) {
        let overlay = Arc::new(OverlayService::new(NodeSelectionConfig::default()));
        let containment = Arc::new(Containment::new(1));
        let reporter = Reporter::new(overlay.clone(), containment.clone(), 2);
        (overlay, containment, reporter)
    }

    fn register(overlay: &OverlayService) -> NodeId {
        overlay.update_contact(Identity::generate().public_key(), "addr".into(), 1, 1)
    }

    #[test]
    fn test_record_applies_all_classes() {
        let (overlay, _containment, reporter) = setup();
        let a = register(&overlay);
        let b = register(&overlay);
        let c = register(&overlay);

        reporter
            .record(&Report {
                successes: vec![a],
                fails: vec![b],
                offlines: vec![c],
                pending_audits: vec![],
            })
            .expect("record");

        assert_eq!(overlay.get(&a).unwrap().reputation.audit_success_count, 1);
        assert_eq!(overlay.get(&b).unwrap().reputation.audit_count, 1);
        assert_eq!(overlay.get(&b).unwrap().reputation.audit_success_count, 0);
        assert_eq!(overlay.get(&c).unwrap().reputation.uptime_count, 1);
    }

    #[test]
    fn test_record_fails_for_unknown_node() {
        let (_overlay, _containment, reporter) = setup();
        let ghost = NodeId::from_public_key_bytes(&[9; 32]);
        let err = reporter
            .record(&Report {
                successes: vec![ghost],
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_age_out_tallies_offline() {
        let (overlay, containment, reporter) = setup();
        let node = register(&overlay);
        containment.insert(
            crate::audit::PendingAudit {
                node_id: node,
                piece_id: orbit_common::id::PieceId::generate(),
                stripe_index: 0,
                share_size: 64,
                expected_share_hash: [0; 32],
                path: orbit_common::path::SegmentPath::new(
                    "p",
                    orbit_common::path::SegmentRef::Last,
                    "b",
                    b"o",
                )
                .expect("path"),
            },
            0, // created long ago relative to the 1 ms window
        );

        let aged = reporter.age_out_containment();
        assert_eq!(aged, 1);
        assert!(containment.is_empty());
        assert_eq!(overlay.get(&node).unwrap().reputation.uptime_count, 1);
    }
}
