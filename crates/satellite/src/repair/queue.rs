//! The repair queue.
//!
//! A multi-writer, multi-reader queue of injured segments, ordered by injury
//! severity (fewest healthy pieces first), deduplicated by segment path.
//! A dequeue takes a lease; at most one worker repairs a segment at a time.
//! A worker that dies holds its lease until it goes stale, after which the
//! entry is reclaimable. Entries that keep failing are dead-lettered after a
//! bounded number of attempts and surface to operators.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use orbit_common::path::SegmentPath;

/// One dequeued work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjuredSegment {
    pub path: SegmentPath,
    pub healthy: u16,
}

#[derive(Debug)]
struct Entry {
    healthy: u16,
    seq: u64,
    attempts: u32,
    lease_until_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<SegmentPath, Entry>,
    seq: u64,
    dead: Vec<(SegmentPath, u32)>,
}

#[derive(Debug)]
pub struct RepairQueue {
    lease_ms: u64,
    max_attempts: u32,
    state: Mutex<State>,
}

impl RepairQueue {
    #[must_use]
    pub fn new(lease_ms: u64, max_attempts: u32) -> Self {
        RepairQueue {
            lease_ms,
            max_attempts,
            state: Mutex::new(State::default()),
        }
    }

    /// Enqueue or refresh an injured segment. Re-inserting an existing path
    /// updates its severity and keeps its attempt count.
    pub fn insert(&self, path: SegmentPath, healthy: u16) {
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        state
            .entries
            .entry(path)
            .and_modify(|entry| entry.healthy = healthy)
            .or_insert(Entry {
                healthy,
                seq,
                attempts: 0,
                lease_until_ms: None,
            });
    }

    /// Take the most injured unleased segment, acquiring a lease on it.
    /// Stale leases are reclaimed here.
    pub fn dequeue(&self, now_ms: u64) -> Option<InjuredSegment> {
        let mut state = self.state.lock();
        let candidate = state
            .entries
            .iter()
            .filter(|(_, entry)| match entry.lease_until_ms {
                Some(until) => until < now_ms, // stale lease
                None => true,
            })
            .min_by_key(|(_, entry)| (entry.healthy, entry.seq))
            .map(|(path, entry)| InjuredSegment {
                path: path.clone(),
                healthy: entry.healthy,
            })?;
        if let Some(entry) = state.entries.get_mut(&candidate.path) {
            entry.lease_until_ms = Some(now_ms + self.lease_ms);
        }
        debug!(path = %candidate.path, healthy = candidate.healthy, "segment dequeued for repair");
        Some(candidate)
    }

    /// Extend the lease while a long repair is in flight.
    pub fn renew(&self, path: &SegmentPath, now_ms: u64) {
        if let Some(entry) = self.state.lock().entries.get_mut(path) {
            if entry.lease_until_ms.is_some() {
                entry.lease_until_ms = Some(now_ms + self.lease_ms);
            }
        }
    }

    /// Remove a finished (or no-longer-injured) segment.
    pub fn complete(&self, path: &SegmentPath) {
        self.state.lock().entries.remove(path);
    }

    /// Record a failed attempt: requeue, or dead-letter past the budget.
    pub fn fail(&self, path: &SegmentPath) {
        let mut state = self.state.lock();
        let dead = match state.entries.get_mut(path) {
            Some(entry) => {
                entry.attempts += 1;
                entry.lease_until_ms = None;
                entry.attempts >= self.max_attempts
            }
            None => return,
        };
        if dead {
            if let Some(entry) = state.entries.remove(path) {
                warn!(%path, attempts = entry.attempts, "repair dead-lettered");
                state.dead.push((path.clone(), entry.attempts));
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Segments abandoned after repeated failures, for operator attention.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<(SegmentPath, u32)> {
        self.state.lock().dead.clone()
    }
}
