//! Single-use serial-number tracking.
//!
//! Serial numbers are single-use network-wide; a node that sees a duplicate
//! MUST reject it, otherwise a client could replay one paid order limit
//! forever. The seen-set is time-bounded: entries fall out once the order
//! has expired past the retention window (by then the satellite side also
//! refuses settlement). The set lives in memory and is persisted on close so
//! a restart does not reopen the replay window.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use orbit_common::error::{Error, Result};
use orbit_common::id::SerialNumber;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Seen {
    /// serial -> order expiration (ms); retention counts from expiration.
    entries: HashMap<SerialNumber, u64>,
}

#[derive(Debug)]
pub struct SerialStore {
    retention_ms: u64,
    seen: RwLock<Seen>,
}

impl SerialStore {
    #[must_use]
    pub fn new(retention_ms: u64) -> Self {
        SerialStore {
            retention_ms,
            seen: RwLock::new(Seen::default()),
        }
    }

    /// Record first use of a serial. A repeat within the retention window is
    /// a replay and is rejected.
    pub fn insert(&self, serial: SerialNumber, order_expiration_ms: u64) -> Result<()> {
        let mut seen = self.seen.write();
        if seen.entries.contains_key(&serial) {
            return Err(Error::permission_denied(format!(
                "serial {} already used",
                serial
            )));
        }
        seen.entries.insert(serial, order_expiration_ms);
        Ok(())
    }

    /// Drop serials whose retention window has passed.
    pub fn purge(&self, now_ms: u64) -> usize {
        let mut seen = self.seen.write();
        let before = seen.entries.len();
        seen.entries
            .retain(|_, expiration| expiration.saturating_add(self.retention_ms) >= now_ms);
        let purged = before - seen.entries.len();
        if purged > 0 {
            debug!(purged, "serial seen-set purged");
        }
        purged
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = bincode::serialize(&*self.seen.read())
            .map_err(|e| Error::internal(format!("serial store encode: {}", e)))?;
        std::fs::write(path.as_ref(), raw)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, retention_ms: u64) -> Result<Self> {
        let raw = match std::fs::read(path.as_ref()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(retention_ms));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let seen: Seen = bincode::deserialize(&raw)
            .map_err(|e| Error::corrupt(format!("serial store decode: {}", e)))?;
        Ok(SerialStore {
            retention_ms,
            seen: RwLock::new(seen),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_serial_rejected() {
        let store = SerialStore::new(1000);
        let serial = SerialNumber::generate();
        store.insert(serial, 5000).expect("first use");
        let err = store.insert(serial, 5000).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[test]
    fn test_purge_respects_retention() {
        let store = SerialStore::new(1000);
        let old = SerialNumber::generate();
        let fresh = SerialNumber::generate();
        store.insert(old, 1_000).expect("old");
        store.insert(fresh, 10_000).expect("fresh");

        // at t=1999 the old serial is still inside expiration+retention
        assert_eq!(store.purge(1_999), 0);
        // at t=2001 it has aged out
        assert_eq!(store.purge(2_001), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_persist_load_roundtrip() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let path = tmp.path().join("serials.db");
        let serial = SerialNumber::generate();
        {
            let store = SerialStore::new(1000);
            store.insert(serial, 9000).expect("insert");
            store.persist(&path).expect("persist");
        }
        let restored = SerialStore::load(&path, 1000).expect("load");
        assert_eq!(restored.len(), 1);
        // replay across restart still rejected
        assert!(restored.insert(serial, 9000).is_err());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let store = SerialStore::load("/nonexistent/serials.db", 1000).expect("load");
        assert!(store.is_empty());
    }
}
