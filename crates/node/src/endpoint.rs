//! The piecestore surface.
//!
//! Each operation takes the signed order limit that authorizes it, runs the
//! full verification chain (whitelist, signature, expiration, addressing,
//! action, single-use serial), moves the bytes, and leaves a countersigned
//! receipt in the unsent set for settlement. Nothing touches disk before the
//! limit checks out, so a rejected request costs the node only a signature
//! verification.
//!
//! ## Deletes
//!
//! Deletion is authorized by a `Delete` order limit but produces no receipt:
//! deletes are idempotent and unbilled, so there is nothing to settle. The
//! serial is still consumed to keep replay symmetric with the other actions.

use std::sync::Arc;

use tracing::debug;

use orbit_common::error::{Error, Result};
use orbit_common::id::{NodeId, PieceId};
use orbit_common::identity::Identity;
use orbit_common::orders::{Action, Order, OrderLimit, PieceHash};
use orbit_common::time::now_ms;

use crate::gc::{self, GcSummary, RetainRequest};
use crate::orders::settlement::{SettlementItem, UnsentOrders};
use crate::orders::{verify_order, verify_order_limit, SerialStore};
use crate::pieces::{PieceHeader, PieceStore};
use crate::trust::TrustedSatellites;

const UPLOAD_CHUNK: usize = 64 * 1024;

/// One storage node's request surface. Cheap to clone.
#[derive(Clone)]
pub struct NodeEndpoint {
    identity: Arc<Identity>,
    store: PieceStore,
    trust: Arc<TrustedSatellites>,
    serials: Arc<SerialStore>,
    unsent: Arc<UnsentOrders>,
}

impl std::fmt::Debug for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEndpoint")
            .field("node_id", &self.identity.node_id())
            .finish()
    }
}

impl NodeEndpoint {
    pub fn new(
        identity: Arc<Identity>,
        store: PieceStore,
        trust: Arc<TrustedSatellites>,
        serials: Arc<SerialStore>,
        unsent: Arc<UnsentOrders>,
    ) -> Self {
        NodeEndpoint {
            identity,
            store,
            trust,
            serials,
            unsent,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    #[must_use]
    pub fn public_key(&self) -> orbit_common::identity::PublicKey {
        self.identity.public_key()
    }

    #[must_use]
    pub fn store(&self) -> &PieceStore {
        &self.store
    }

    #[must_use]
    pub fn unsent_orders(&self) -> &Arc<UnsentOrders> {
        &self.unsent
    }

    fn record_receipt(&self, limit: &OrderLimit, order: Order) {
        self.unsent.enqueue(
            limit.satellite_id,
            SettlementItem {
                limit: limit.clone(),
                order,
            },
        );
    }

    /// Store a piece under a PUT or PUT_REPAIR limit. Returns this node's
    /// signed piece hash for the uploader to present to the satellite.
    pub fn upload(
        &self,
        limit: &OrderLimit,
        uplink_hash: &PieceHash,
        payload: &[u8],
        order: &Order,
    ) -> Result<PieceHash> {
        verify_order_limit(
            limit,
            &[Action::Put, Action::PutRepair],
            self.node_id(),
            &self.trust,
            now_ms(),
        )?;
        if payload.len() as u64 > limit.limit {
            return Err(Error::permission_denied(format!(
                "upload of {} bytes exceeds order limit {}",
                payload.len(),
                limit.limit
            )));
        }
        verify_order(order, limit)?;
        self.serials.insert(limit.serial, limit.order_expiration_ms)?;

        let mut writer =
            self.store
                .create(limit.satellite_id, limit.piece_id, Some(payload.len() as u64))?;
        for chunk in payload.chunks(UPLOAD_CHUNK) {
            if let Err(err) = writer.write_all(chunk) {
                let _ = writer.cancel();
                return Err(err);
            }
        }
        let node_hash = writer.commit(&self.identity, limit.clone(), uplink_hash.clone())?;

        self.record_receipt(limit, order.clone());
        debug!(piece = %limit.piece_id, bytes = payload.len(), action = limit.action.as_str(), "upload served");
        Ok(node_hash)
    }

    /// Serve a payload range under a GET, GET_AUDIT or GET_REPAIR limit.
    pub fn download(
        &self,
        limit: &OrderLimit,
        offset: u64,
        length: u64,
        order: &Order,
    ) -> Result<Vec<u8>> {
        verify_order_limit(
            limit,
            &[Action::Get, Action::GetAudit, Action::GetRepair],
            self.node_id(),
            &self.trust,
            now_ms(),
        )?;
        if length > limit.limit {
            return Err(Error::permission_denied(format!(
                "download of {} bytes exceeds order limit {}",
                length, limit.limit
            )));
        }
        if order.amount < length {
            return Err(Error::invalid("receipt amount below requested length"));
        }
        verify_order(order, limit)?;
        self.serials.insert(limit.serial, limit.order_expiration_ms)?;

        let mut reader = self.store.open(limit.satellite_id, limit.piece_id)?;
        let bytes = reader.read_at(offset, length as usize)?;

        self.record_receipt(limit, order.clone());
        debug!(piece = %limit.piece_id, offset, length, action = limit.action.as_str(), "download served");
        Ok(bytes)
    }

    /// Delete a piece under a DELETE limit. Idempotent; `strict` makes a
    /// missing piece an error instead of `Ok(false)`.
    pub fn delete(&self, limit: &OrderLimit, strict: bool) -> Result<bool> {
        verify_order_limit(limit, &[Action::Delete], self.node_id(), &self.trust, now_ms())?;
        self.serials.insert(limit.serial, limit.order_expiration_ms)?;

        let removed = self.store.delete(limit.satellite_id, limit.piece_id)?;
        if !removed && strict {
            return Err(Error::not_found(format!("piece {}", limit.piece_id)));
        }
        Ok(removed)
    }

    /// Read a piece's header for inspection. Trusted-satellite callers only;
    /// no receipt is produced.
    pub fn piece_header(&self, satellite: NodeId, piece: PieceId) -> Result<PieceHeader> {
        if !self.trust.is_trusted(&satellite) {
            return Err(Error::permission_denied(format!("untrusted satellite {}", satellite)));
        }
        Ok(self.store.open(satellite, piece)?.header().clone())
    }

    /// Apply a satellite retain filter (garbage collection).
    pub fn apply_retain(&self, satellite: NodeId, request: &RetainRequest) -> Result<GcSummary> {
        if !self.trust.is_trusted(&satellite) {
            return Err(Error::permission_denied(format!("untrusted satellite {}", satellite)));
        }
        gc::apply_retain(&self.store, satellite, request)
    }

    /// Verify a retain request's satellite signature and apply it. Retain is
    /// not an order-limit operation, so it carries its own signature.
    pub fn apply_signed_retain(&self, signed: &orbit_proto::SignedRetain) -> Result<GcSummary> {
        let satellite_key = self.trust.get(&signed.satellite_id)?;
        signed.verify(&satellite_key)?;
        gc::apply_retain(&self.store, signed.satellite_id, &signed.request)
    }

    /// Drop pieces past their TTL for every trusted satellite.
    pub fn sweep_expired(&self) -> Result<GcSummary> {
        let now = now_ms();
        let mut total = GcSummary::default();
        for satellite in self.trust.ids() {
            let summary = gc::sweep_expired(&self.store, satellite, now)?;
            total.checked += summary.checked;
            total.deleted += summary.deleted;
            total.reclaimed_bytes += summary.reclaimed_bytes;
            total.failed += summary.failed;
        }
        Ok(total)
    }
}
