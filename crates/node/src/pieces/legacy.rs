//! Format-v0 header table.
//!
//! Before the embedded header, piece files were bare payload and the header
//! fields lived in a database row. A piece is v0 exactly when it appears in
//! this table. The table is read-only from the store's point of view: it is
//! loaded at startup for mixed-format deployments and entries disappear only
//! when the piece itself is deleted. New writes are always v1.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use orbit_common::error::{Error, Result};
use orbit_common::id::{NodeId, PieceId};

use super::header::PieceHeader;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Table {
    rows: HashMap<(NodeId, PieceId), PieceHeader>,
}

/// In-memory v0 header rows keyed by (satellite, piece).
#[derive(Debug, Default)]
pub struct V0HeaderTable {
    table: RwLock<Table>,
}

impl V0HeaderTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows persisted by a previous process. Missing file means an
    /// all-v1 deployment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = match std::fs::read(path.as_ref()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new());
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let table: Table = bincode::deserialize(&raw)
            .map_err(|e| Error::corrupt(format!("v0 header table decode: {}", e)))?;
        Ok(V0HeaderTable {
            table: RwLock::new(table),
        })
    }

    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = bincode::serialize(&*self.table.read())
            .map_err(|e| Error::internal(format!("v0 header table encode: {}", e)))?;
        std::fs::write(path.as_ref(), raw)?;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, satellite: &NodeId, piece: &PieceId) -> Option<PieceHeader> {
        self.table.read().rows.get(&(*satellite, *piece)).cloned()
    }

    #[must_use]
    pub fn is_v0(&self, satellite: &NodeId, piece: &PieceId) -> bool {
        self.table.read().rows.contains_key(&(*satellite, *piece))
    }

    /// Migration/test seeding only; production writes are v1.
    pub fn insert(&self, satellite: NodeId, piece: PieceId, header: PieceHeader) {
        self.table.write().rows.insert((satellite, piece), header);
    }

    pub fn remove(&self, satellite: &NodeId, piece: &PieceId) {
        self.table.write().rows.remove(&(*satellite, *piece));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
