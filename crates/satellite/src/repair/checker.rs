//! The injury checker.
//!
//! Sweeps the pointer store counting healthy pieces per remote segment
//! against the current overlay state. Segments at or below the repair
//! threshold are enqueued, most injured first; segments below the
//! reconstruction minimum are recorded as irreparable and surfaced to
//! operators instead — the repair worker cannot help them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use orbit_common::path::SegmentPath;
use orbit_common::time::now_ms;

use crate::metainfo::{ListOptions, Service};
use crate::overlay::OverlayService;
use crate::repair::queue::RepairQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckerStats {
    pub checked: usize,
    pub enqueued: usize,
    pub irreparable: usize,
}

pub struct Checker {
    metainfo: Arc<Service>,
    overlay: Arc<OverlayService>,
    queue: Arc<RepairQueue>,
    irreparable: Mutex<HashMap<SegmentPath, u16>>,
}

impl Checker {
    #[must_use]
    pub fn new(metainfo: Arc<Service>, overlay: Arc<OverlayService>, queue: Arc<RepairQueue>) -> Self {
        Checker {
            metainfo,
            overlay,
            queue,
            irreparable: Mutex::new(HashMap::new()),
        }
    }

    /// One full sweep of the pointer store.
    pub fn run_once(&self) -> CheckerStats {
        let mut stats = CheckerStats::default();
        let now = now_ms();
        for (path, pointer) in self.metainfo.list(&ListOptions::default()) {
            let remote = match pointer.remote() {
                Some(remote) => remote,
                None => continue,
            };
            if pointer.is_expired(now) {
                continue; // expiry reclaims these, not repair
            }
            stats.checked += 1;

            let healthy = remote
                .pieces
                .iter()
                .filter(|piece| self.overlay.is_healthy(&piece.node_id))
                .count() as u16;

            if healthy < remote.redundancy.required {
                error!(%path, healthy, required = remote.redundancy.required, "segment irreparable");
                self.irreparable.lock().insert(path, healthy);
                stats.irreparable += 1;
            } else if healthy <= remote.redundancy.repair {
                self.queue.insert(path, healthy);
                stats.enqueued += 1;
            }
        }
        if stats.enqueued > 0 || stats.irreparable > 0 {
            info!(
                checked = stats.checked,
                enqueued = stats.enqueued,
                irreparable = stats.irreparable,
                "checker sweep complete"
            );
        }
        stats
    }

    /// Segments currently beyond repair, for out-of-band recovery.
    #[must_use]
    pub fn irreparable(&self) -> Vec<(SegmentPath, u16)> {
        self.irreparable
            .lock()
            .iter()
            .map(|(path, healthy)| (path.clone(), *healthy))
            .collect()
    }

    /// Drop an irreparable record once recovered or abandoned.
    pub fn clear_irreparable(&self, path: &SegmentPath) {
        self.irreparable.lock().remove(path);
    }
}
