//! Satellite order plane: issuance, settlement, archival and the bandwidth
//! rollup.
//!
//! Issuance mints a fresh 16-byte serial per limit and records it; a serial
//! collision inside the retention window means the RNG is broken and is
//! surfaced as `Corrupt` (operator-alertable), never silently reissued.
//!
//! Settlement is idempotent per (serial, storage node): the first valid
//! receipt credits the rollup, every replay is a no-op. Receipts arriving
//! after `expiration + grace` are rejected. Archival moves settled rows out
//! of the hot set once they are final and forgets issued serials past the
//! retention window.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use orbit_common::config::OrdersConfig;
use orbit_common::error::{Error, Result};
use orbit_common::id::{NodeId, PieceId, SerialNumber};
use orbit_common::identity::{Identity, PublicKey};
use orbit_common::orders::{sign_order_limit, Action, Order, OrderLimit};
use orbit_common::time::{hour_bucket, now_ms};
use orbit_proto::SettlementItem;

// ════════════════════════════════════════════════════════════════════════════
// BANDWIDTH ROLLUP
// ════════════════════════════════════════════════════════════════════════════

/// Hourly bandwidth totals per (node, action). Rows are append-only within a
/// window; settlement idempotency above guarantees each serial contributes
/// at most once.
#[derive(Debug, Default)]
pub struct BandwidthRollup {
    rows: RwLock<HashMap<(NodeId, Action, u64), u64>>,
}

impl BandwidthRollup {
    fn add(&self, node: NodeId, action: Action, when_ms: u64, amount: u64) {
        *self
            .rows
            .write()
            .entry((node, action, hour_bucket(when_ms)))
            .or_insert(0) += amount;
    }

    /// Total bytes for one node and action across all windows.
    #[must_use]
    pub fn total(&self, node: &NodeId, action: Action) -> u64 {
        self.rows
            .read()
            .iter()
            .filter(|((n, a, _), _)| n == node && *a == action)
            .map(|(_, amount)| *amount)
            .sum()
    }

    /// Total for one hour window.
    #[must_use]
    pub fn window_total(&self, node: &NodeId, action: Action, when_ms: u64) -> u64 {
        self.rows
            .read()
            .get(&(*node, action, hour_bucket(when_ms)))
            .copied()
            .unwrap_or(0)
    }

    /// Network-wide total per action, for capacity accounting.
    #[must_use]
    pub fn action_total(&self, action: Action) -> u64 {
        self.rows
            .read()
            .iter()
            .filter(|((_, a, _), _)| *a == action)
            .map(|(_, amount)| *amount)
            .sum()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ORDERS SERVICE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
struct SettledRow {
    amount: u64,
    expiration_ms: u64,
}

#[derive(Debug, Default)]
struct OrdersState {
    /// serial -> order expiration, for collision detection and retention.
    issued: HashMap<SerialNumber, u64>,
    settled: HashMap<(SerialNumber, NodeId), SettledRow>,
    archived: HashMap<(SerialNumber, NodeId), u64>,
}

/// Summary returned to the settling storage node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettleSummary {
    pub accepted: usize,
    pub rejected: usize,
}

pub struct OrdersService {
    identity: Arc<Identity>,
    config: OrdersConfig,
    state: Mutex<OrdersState>,
    rollup: BandwidthRollup,
}

impl std::fmt::Debug for OrdersService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrdersService")
            .field("satellite", &self.identity.node_id())
            .finish()
    }
}

impl OrdersService {
    #[must_use]
    pub fn new(identity: Arc<Identity>, config: OrdersConfig) -> Self {
        OrdersService {
            identity,
            config,
            state: Mutex::new(OrdersState::default()),
            rollup: BandwidthRollup::default(),
        }
    }

    #[must_use]
    pub fn satellite_id(&self) -> NodeId {
        self.identity.node_id()
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    #[must_use]
    pub fn rollup(&self) -> &BandwidthRollup {
        &self.rollup
    }

    /// Mint one signed order limit.
    pub fn issue(
        &self,
        uplink_id: NodeId,
        uplink_public_key: PublicKey,
        storage_id: NodeId,
        piece_id: PieceId,
        action: Action,
        limit_bytes: u64,
        piece_expiration_ms: Option<u64>,
    ) -> Result<OrderLimit> {
        let expiration = now_ms() + self.config.order_lifetime_ms;
        let limit = sign_order_limit(
            &self.identity,
            uplink_id,
            uplink_public_key,
            storage_id,
            piece_id,
            action,
            limit_bytes,
            piece_expiration_ms,
            expiration,
        );
        let mut state = self.state.lock();
        if state.issued.insert(limit.serial, expiration).is_some() {
            error!(serial = %limit.serial, "serial number collision from the RNG");
            return Err(Error::corrupt(format!("serial collision on {}", limit.serial)));
        }
        debug!(serial = %limit.serial, action = action.as_str(), node = %storage_id, "order limit issued");
        Ok(limit)
    }

    /// Issue a limit for the satellite's own audit/repair worker, which acts
    /// as its own uplink, and countersign the matching order up front.
    pub fn issue_for_worker(
        &self,
        storage_id: NodeId,
        piece_id: PieceId,
        action: Action,
        limit_bytes: u64,
    ) -> Result<(OrderLimit, Order)> {
        let limit = self.issue(
            self.identity.node_id(),
            self.identity.public_key(),
            storage_id,
            piece_id,
            action,
            limit_bytes,
            None,
        )?;
        let order = Order::sign(&self.identity, &limit, limit_bytes);
        Ok((limit, order))
    }

    /// Idempotently settle one batch of receipts from `storage_node`.
    pub fn settle(&self, storage_node: NodeId, items: &[SettlementItem]) -> SettleSummary {
        let now = now_ms();
        let mut summary = SettleSummary::default();
        let mut state = self.state.lock();

        for item in items {
            let limit = &item.limit;
            let order = &item.order;
            let valid = limit.satellite_id == self.satellite_id()
                && limit.verify_signature(&self.identity.public_key()).is_ok()
                && limit.storage_id == storage_node
                && order.serial == limit.serial
                && order.amount <= limit.limit
                && order.verify_signature(&limit.uplink_public_key).is_ok();
            if !valid {
                warn!(serial = %order.serial, node = %storage_node, "settlement receipt rejected");
                summary.rejected += 1;
                continue;
            }
            if now > limit.order_expiration_ms + self.config.settlement_grace_ms {
                warn!(serial = %order.serial, "settlement past grace window");
                summary.rejected += 1;
                continue;
            }
            let key = (order.serial, storage_node);
            if state.settled.contains_key(&key) || state.archived.contains_key(&key) {
                // replay: a no-op on totals
                summary.rejected += 1;
                continue;
            }
            state.settled.insert(
                key,
                SettledRow {
                    amount: order.amount,
                    expiration_ms: limit.order_expiration_ms,
                },
            );
            self.rollup.add(storage_node, limit.action, now, order.amount);
            summary.accepted += 1;
        }
        debug!(
            node = %storage_node,
            accepted = summary.accepted,
            rejected = summary.rejected,
            "settlement batch processed"
        );
        summary
    }

    /// Move final receipts to the archive and forget expired serials.
    /// Run periodically; bounds the hot serial set.
    pub fn archive(&self, now_ms: u64) -> usize {
        let grace = self.config.settlement_grace_ms;
        let mut state = self.state.lock();

        let final_keys: Vec<(SerialNumber, NodeId)> = state
            .settled
            .iter()
            .filter(|(_, row)| row.expiration_ms + grace < now_ms)
            .map(|(key, _)| *key)
            .collect();
        let moved = final_keys.len();
        for key in final_keys {
            if let Some(row) = state.settled.remove(&key) {
                state.archived.insert(key, row.amount);
            }
        }

        let retention = self.config.serial_retention_ms;
        state
            .issued
            .retain(|_, expiration| *expiration + retention >= now_ms);
        if moved > 0 {
            info!(moved, "settled receipts archived");
        }
        moved
    }

    #[must_use]
    pub fn settled_count(&self) -> usize {
        self.state.lock().settled.len()
    }

    #[must_use]
    pub fn archived_count(&self) -> usize {
        self.state.lock().archived.len()
    }
}
