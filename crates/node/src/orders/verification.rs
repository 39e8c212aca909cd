//! Order-limit and receipt verification on the storage node.
//!
//! Every request that moves bytes presents an order limit; nothing is read
//! from or written to disk until the limit passes all of:
//!
//! 1. addressed to this node,
//! 2. issued by a whitelisted satellite and signature valid,
//! 3. not expired,
//! 4. the embedded uplink key matches the uplink id,
//! 5. the action matches the request type.
//!
//! Serial single-use is enforced separately by [`super::serials`] so the
//! check-and-record is one atomic step.

use orbit_common::error::{Error, Result};
use orbit_common::id::NodeId;
use orbit_common::orders::{Action, Order, OrderLimit};

use crate::trust::TrustedSatellites;

pub fn verify_order_limit(
    limit: &OrderLimit,
    allowed_actions: &[Action],
    node_id: NodeId,
    trust: &TrustedSatellites,
    now_ms: u64,
) -> Result<()> {
    if limit.storage_id != node_id {
        return Err(Error::permission_denied(format!(
            "order limit addressed to {}, this node is {}",
            limit.storage_id, node_id
        )));
    }
    let satellite_key = trust.get(&limit.satellite_id)?;
    limit.verify_signature(&satellite_key)?;
    if limit.is_expired(now_ms) {
        return Err(Error::permission_denied(format!(
            "order limit expired at {} (now {})",
            limit.order_expiration_ms, now_ms
        )));
    }
    if limit.uplink_public_key.node_id() != limit.uplink_id {
        return Err(Error::unauthenticated(
            "uplink public key does not match uplink id in order limit",
        ));
    }
    if !allowed_actions.contains(&limit.action) {
        return Err(Error::permission_denied(format!(
            "action {} not allowed for this request",
            limit.action.as_str()
        )));
    }
    Ok(())
}

/// Verify the countersigned receipt against its limit: same serial, amount
/// within the authorized budget, signed by the uplink named in the limit.
pub fn verify_order(order: &Order, limit: &OrderLimit) -> Result<()> {
    if order.serial != limit.serial {
        return Err(Error::invalid("order serial does not match limit serial"));
    }
    if order.amount > limit.limit {
        return Err(Error::permission_denied(format!(
            "order amount {} exceeds limit {}",
            order.amount, limit.limit
        )));
    }
    order.verify_signature(&limit.uplink_public_key)
}
