//! Trusted-satellite whitelist.
//!
//! A storage node only honors order limits signed by satellites it has been
//! configured to trust. The whitelist maps satellite node ids to the public
//! keys that authenticate them; an order limit from any other issuer is
//! rejected with `PermissionDenied` before any disk or bandwidth is spent.

use std::collections::HashMap;

use parking_lot::RwLock;

use orbit_common::error::{Error, Result};
use orbit_common::id::NodeId;
use orbit_common::identity::PublicKey;

#[derive(Debug, Default)]
pub struct TrustedSatellites {
    entries: RwLock<HashMap<NodeId, PublicKey>>,
}

impl TrustedSatellites {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a satellite. The id is recomputed from the key so a
    /// mismatched configuration entry cannot poison the whitelist.
    pub fn add(&self, public_key: PublicKey) -> NodeId {
        let node_id = public_key.node_id();
        self.entries.write().insert(node_id, public_key);
        node_id
    }

    pub fn get(&self, satellite: &NodeId) -> Result<PublicKey> {
        self.entries
            .read()
            .get(satellite)
            .copied()
            .ok_or_else(|| Error::permission_denied(format!("untrusted satellite {}", satellite)))
    }

    #[must_use]
    pub fn is_trusted(&self, satellite: &NodeId) -> bool {
        self.entries.read().contains_key(satellite)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<NodeId> {
        self.entries.read().keys().copied().collect()
    }
}
