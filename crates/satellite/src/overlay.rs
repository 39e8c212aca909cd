//! Overlay: per-node state and selection.
//!
//! One authoritative store, three writers: the contact chore (address,
//! capacity, uptime), the reputation updater (audit counters), and the
//! disqualifier. All three take the same write lock, so ratios never drift
//! from their counters and a disqualification decision always sees the
//! counters it is judging.
//!
//! ## Invariants
//!
//! - `0 <= audit_success_count <= audit_count`, same for uptime.
//! - Ratios equal `success / count` whenever `count > 0`; a zero count means
//!   "unknown" and passes selection filters only while the node is unvetted.
//! - `disqualified_at` is set once and never cleared. Disqualified nodes are
//!   invisible to selection but their pieces stay in pointers until repair
//!   removes them.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{info, warn};

use orbit_common::config::NodeSelectionConfig;
use orbit_common::error::{Error, Result};
use orbit_common::id::NodeId;
use orbit_common::identity::PublicKey;
use orbit_common::time::now_ms;

use crate::metainfo::NodeKeySource;

// ════════════════════════════════════════════════════════════════════════════
// DOSSIER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize)]
pub struct Reputation {
    pub audit_count: u64,
    pub audit_success_count: u64,
    pub uptime_count: u64,
    pub uptime_success_count: u64,
    pub audit_success_ratio: f64,
    pub uptime_ratio: f64,
    pub last_contact_success_ms: u64,
    pub last_contact_failure_ms: u64,
    pub disqualified_at_ms: Option<u64>,
}

impl Reputation {
    fn recompute_ratios(&mut self) {
        self.audit_success_ratio = ratio(self.audit_success_count, self.audit_count);
        self.uptime_ratio = ratio(self.uptime_success_count, self.uptime_count);
    }

    #[must_use]
    pub fn is_disqualified(&self) -> bool {
        self.disqualified_at_ms.is_some()
    }
}

fn ratio(success: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        success as f64 / total as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeDossier {
    pub node_id: NodeId,
    #[serde(skip)]
    pub public_key: PublicKey,
    pub address: String,
    pub free_disk: u64,
    pub free_bandwidth: u64,
    pub reputation: Reputation,
}

/// Outcome classes a Report applies per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Fail,
    Offline,
}

/// Selection request.
#[derive(Debug, Clone, Default)]
pub struct FindRequest {
    pub count: usize,
    pub free_disk: u64,
    pub free_bandwidth: u64,
    pub excluded: HashSet<NodeId>,
}

// ════════════════════════════════════════════════════════════════════════════
// SERVICE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct OverlayService {
    config: NodeSelectionConfig,
    nodes: RwLock<HashMap<NodeId, NodeDossier>>,
}

impl OverlayService {
    #[must_use]
    pub fn new(config: NodeSelectionConfig) -> Self {
        OverlayService {
            nodes: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Contact chore: upsert address and declared capacity. Registration
    /// does not touch reputation.
    pub fn update_contact(
        &self,
        public_key: PublicKey,
        address: String,
        free_disk: u64,
        free_bandwidth: u64,
    ) -> NodeId {
        let node_id = public_key.node_id();
        let mut nodes = self.nodes.write();
        let dossier = nodes.entry(node_id).or_insert_with(|| NodeDossier {
            node_id,
            public_key,
            address: String::new(),
            free_disk: 0,
            free_bandwidth: 0,
            reputation: Reputation::default(),
        });
        dossier.address = address;
        dossier.free_disk = free_disk;
        dossier.free_bandwidth = free_bandwidth;
        node_id
    }

    /// Uptime ping result from the contact chore.
    pub fn record_uptime(&self, node_id: &NodeId, success: bool) -> Result<()> {
        let mut nodes = self.nodes.write();
        let dossier = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::not_found(format!("node {}", node_id)))?;
        let now = now_ms();
        let rep = &mut dossier.reputation;
        rep.uptime_count += 1;
        if success {
            rep.uptime_success_count += 1;
            rep.last_contact_success_ms = now;
        } else {
            rep.last_contact_failure_ms = now;
        }
        rep.recompute_ratios();
        Ok(())
    }

    pub fn get(&self, node_id: &NodeId) -> Result<NodeDossier> {
        self.nodes
            .read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node {}", node_id)))
    }

    /// True when the node exists, is not disqualified, and is reachable as
    /// far as the overlay knows. Used by the repair checker's health count.
    #[must_use]
    pub fn is_healthy(&self, node_id: &NodeId) -> bool {
        self.nodes
            .read()
            .get(node_id)
            .map(|d| !d.reputation.is_disqualified())
            .unwrap_or(false)
    }

    /// Apply one audit outcome, recompute ratios and run the
    /// disqualification check — all under one lock, so selection can never
    /// observe counters without their consequences.
    pub fn apply_audit(&self, node_id: &NodeId, outcome: AuditOutcome) -> Result<()> {
        let mut nodes = self.nodes.write();
        let dossier = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::not_found(format!("node {}", node_id)))?;
        let rep = &mut dossier.reputation;
        match outcome {
            AuditOutcome::Success => {
                rep.audit_count += 1;
                rep.audit_success_count += 1;
            }
            AuditOutcome::Fail => {
                rep.audit_count += 1;
            }
            AuditOutcome::Offline => {
                rep.uptime_count += 1;
            }
        }
        rep.recompute_ratios();

        if rep.disqualified_at_ms.is_none()
            && rep.audit_count >= self.config.audit_threshold
            && rep.audit_success_ratio < self.config.disqualification_threshold
        {
            rep.disqualified_at_ms = Some(now_ms());
            warn!(
                node = %node_id,
                ratio = rep.audit_success_ratio,
                audits = rep.audit_count,
                "node disqualified"
            );
        }
        Ok(())
    }

    /// Operator-initiated disqualification. Terminal, like the automatic
    /// path.
    pub fn disqualify(&self, node_id: &NodeId) -> Result<()> {
        let mut nodes = self.nodes.write();
        let dossier = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::not_found(format!("node {}", node_id)))?;
        if dossier.reputation.disqualified_at_ms.is_none() {
            dossier.reputation.disqualified_at_ms = Some(now_ms());
            info!(node = %node_id, "node disqualified by operator");
        }
        Ok(())
    }

    fn uptime_acceptable(&self, rep: &Reputation) -> bool {
        rep.uptime_count == 0 || rep.uptime_ratio >= self.config.min_uptime_ratio
    }

    fn is_vetted(&self, rep: &Reputation) -> bool {
        rep.audit_count >= self.config.audit_threshold
    }

    /// Select up to `count` eligible nodes uniformly at random, with a fixed
    /// fraction drawn from unvetted nodes so fresh nodes can earn audits.
    pub fn find_storage_nodes(&self, request: &FindRequest) -> Result<Vec<NodeDossier>> {
        let nodes = self.nodes.read();
        let mut vetted: Vec<&NodeDossier> = Vec::new();
        let mut fresh: Vec<&NodeDossier> = Vec::new();
        for dossier in nodes.values() {
            if request.excluded.contains(&dossier.node_id) {
                continue;
            }
            let rep = &dossier.reputation;
            if rep.is_disqualified() {
                continue;
            }
            if dossier.free_disk < request.free_disk
                || dossier.free_bandwidth < request.free_bandwidth
            {
                continue;
            }
            if !self.uptime_acceptable(rep) {
                continue;
            }
            if self.is_vetted(rep) {
                if rep.audit_success_ratio >= self.config.min_audit_success_ratio {
                    vetted.push(dossier);
                }
            } else {
                fresh.push(dossier);
            }
        }

        if vetted.len() + fresh.len() < request.count {
            return Err(Error::unavailable(format!(
                "insufficient nodes: found {}, requested {}",
                vetted.len() + fresh.len(),
                request.count
            )));
        }

        let mut rng = OsRng;
        let fresh_target = ((request.count as f64) * self.config.new_node_fraction).ceil() as usize;
        let fresh_target = fresh_target.min(fresh.len()).min(request.count);

        let mut picked: Vec<NodeDossier> = fresh
            .choose_multiple(&mut rng, fresh_target)
            .map(|d| (*d).clone())
            .collect();
        let from_vetted = (request.count - picked.len()).min(vetted.len());
        picked.extend(
            vetted
                .choose_multiple(&mut rng, from_vetted)
                .map(|d| (*d).clone()),
        );
        if picked.len() < request.count {
            // not enough vetted nodes: top up from the remaining fresh set
            let already: HashSet<NodeId> = picked.iter().map(|d| d.node_id).collect();
            let remaining: Vec<&NodeDossier> = fresh
                .iter()
                .filter(|d| !already.contains(&d.node_id))
                .copied()
                .collect();
            picked.extend(
                remaining
                    .choose_multiple(&mut rng, request.count - picked.len())
                    .map(|d| (*d).clone()),
            );
        }
        Ok(picked)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().keys().copied().collect()
    }
}

impl NodeKeySource for OverlayService {
    fn public_key_for(&self, node_id: &NodeId) -> Option<PublicKey> {
        self.nodes.read().get(node_id).map(|d| d.public_key)
    }
}
