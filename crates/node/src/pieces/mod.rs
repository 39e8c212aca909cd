//! Hash-verified piece storage over the blob store.
//!
//! A piece file is `[512-byte header region][payload]` (format v1). The
//! writer reserves the header region up front, hashes the payload as it
//! streams in, and at commit verifies the uplink's signed hash, fills in the
//! header and renames the file into place — all inside the per-piece lock,
//! together with the capacity-accounting update. On any commit failure the
//! temp file is removed and nothing is charged.
//!
//! ## Concurrency
//!
//! Create/Commit/Delete for the same (satellite, piece) serialize on a
//! per-piece lock. Opens are lock-free: every reader owns an independent
//! file handle.

pub mod header;
pub mod legacy;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use orbit_common::error::{Error, Result};
use orbit_common::id::{NodeId, PieceId};
use orbit_common::identity::Identity;
use orbit_common::orders::{OrderLimit, PieceHash};
use orbit_common::time::now_ms;
use orbit_storage::{BlobInfo, BlobReader, BlobRef, BlobStore, BlobWriter};

pub use header::{HashAlgorithm, PieceHeader, FORMAT_V1, HEADER_RESERVED};
pub use legacy::V0HeaderTable;

type PieceKey = (NodeId, PieceId);

/// Piece store shared by the endpoint, the GC sweep and the settlement
/// plumbing. Cheap to clone; all fields are shared handles.
#[derive(Clone)]
pub struct PieceStore {
    blobs: Arc<dyn BlobStore>,
    monitor: Arc<crate::monitor::CapacityMonitor>,
    v0: Arc<V0HeaderTable>,
    locks: Arc<Mutex<HashMap<PieceKey, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("used_total", &self.monitor.used_total())
            .finish()
    }
}

impl PieceStore {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        monitor: Arc<crate::monitor::CapacityMonitor>,
        v0: Arc<V0HeaderTable>,
    ) -> Self {
        PieceStore {
            blobs,
            monitor,
            v0,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, key: PieceKey) -> Arc<Mutex<()>> {
        self.locks.lock().entry(key).or_default().clone()
    }

    fn blob_ref(satellite: &NodeId, piece: &PieceId) -> BlobRef {
        BlobRef {
            namespace: *satellite.as_bytes(),
            key: *piece.as_bytes(),
        }
    }

    /// Open a writer for a new piece. `size_hint` is a preallocation hint
    /// for the payload; exceeding it is not an error.
    pub fn create(
        &self,
        satellite: NodeId,
        piece: PieceId,
        size_hint: Option<u64>,
    ) -> Result<PieceWriter> {
        self.monitor
            .check_available(HEADER_RESERVED as u64 + size_hint.unwrap_or(0))?;
        let mut blob = self.blobs.create(
            Self::blob_ref(&satellite, &piece),
            size_hint.map(|h| h + HEADER_RESERVED as u64),
        )?;
        // reserve the header region; filled at commit
        blob.write_all(&[0u8; HEADER_RESERVED])?;
        Ok(PieceWriter {
            store: self.clone(),
            satellite,
            piece,
            blob: Some(blob),
            hasher: Sha256::new(),
            payload_size: 0,
        })
    }

    /// Open a committed piece for random reads.
    ///
    /// A v1 file whose header fails verification is quarantined and the
    /// error surfaces as `Integrity`; the garbage sweep reports it to the
    /// satellite as lost.
    pub fn open(&self, satellite: NodeId, piece: PieceId) -> Result<PieceReader> {
        let blob_ref = Self::blob_ref(&satellite, &piece);
        let mut blob = self.blobs.open(blob_ref)?;

        if let Some(header) = self.v0.get(&satellite, &piece) {
            let payload_size = blob.size();
            return Ok(PieceReader {
                blob,
                header,
                payload_offset: 0,
                payload_size,
            });
        }

        let reserved = blob.read_at(0, HEADER_RESERVED.min(blob.size() as usize))?;
        match PieceHeader::from_reserved_bytes(&reserved) {
            Ok(header) => {
                let payload_size = blob.size() - HEADER_RESERVED as u64;
                Ok(PieceReader {
                    blob,
                    header,
                    payload_offset: HEADER_RESERVED as u64,
                    payload_size,
                })
            }
            Err(err) => {
                warn!(%satellite, %piece, %err, "piece header unreadable, quarantining");
                let size = blob.size();
                drop(blob);
                self.blobs.quarantine(blob_ref)?;
                self.monitor.sub(satellite, size);
                Err(Error::integrity(format!("piece {} quarantined: {}", piece, err)))
            }
        }
    }

    /// Unlink a piece. Idempotent: deleting an absent piece returns
    /// `Ok(false)`.
    pub fn delete(&self, satellite: NodeId, piece: PieceId) -> Result<bool> {
        let lock = self.lock_for((satellite, piece));
        let _guard = lock.lock();

        let blob_ref = Self::blob_ref(&satellite, &piece);
        let size = match self.blobs.open(blob_ref) {
            Ok(reader) => reader.size(),
            Err(ref e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let removed = self.blobs.delete(blob_ref)?;
        if removed {
            self.monitor.sub(satellite, size);
            self.v0.remove(&satellite, &piece);
            debug!(%satellite, %piece, size, "piece deleted");
        }
        Ok(removed)
    }

    /// All pieces stored for one satellite.
    pub fn list(&self, satellite: &NodeId) -> Result<Vec<BlobInfo>> {
        self.blobs.list(satellite.as_bytes())
    }

    #[must_use]
    pub fn monitor(&self) -> &crate::monitor::CapacityMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn v0_table(&self) -> &V0HeaderTable {
        &self.v0
    }
}

// ════════════════════════════════════════════════════════════════════════════
// WRITER
// ════════════════════════════════════════════════════════════════════════════

/// Streaming piece writer. `commit` performs the hash and signature checks;
/// anything else ends in `cancel` (or drop, which leaves temp garbage for
/// the startup sweep).
pub struct PieceWriter {
    store: PieceStore,
    satellite: NodeId,
    piece: PieceId,
    blob: Option<BlobWriter>,
    hasher: Sha256,
    payload_size: u64,
}

impl PieceWriter {
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.store
            .monitor
            .check_available(HEADER_RESERVED as u64 + self.payload_size + buf.len() as u64)?;
        let blob = self
            .blob
            .as_mut()
            .ok_or_else(|| Error::internal("write after commit"))?;
        blob.write_all(buf)?;
        Digest::update(&mut self.hasher, buf);
        self.payload_size += buf.len() as u64;
        Ok(())
    }

    #[must_use]
    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// Verify the uplink's signed hash against the written payload, embed
    /// the header, and atomically publish the piece. Returns this node's own
    /// signed piece hash for the uplink to present to the satellite.
    pub fn commit(
        mut self,
        node_identity: &Identity,
        order_limit: OrderLimit,
        uplink_hash: PieceHash,
    ) -> Result<PieceHash> {
        let result = self.commit_inner(node_identity, &order_limit, &uplink_hash);
        if result.is_err() {
            if let Some(blob) = self.blob.take() {
                let _ = blob.cancel();
            }
        }
        result
    }

    fn commit_inner(
        &mut self,
        node_identity: &Identity,
        order_limit: &OrderLimit,
        uplink_hash: &PieceHash,
    ) -> Result<PieceHash> {
        let computed: [u8; 32] = self.hasher.clone().finalize().into();

        if uplink_hash.piece_id != self.piece || order_limit.piece_id != self.piece {
            return Err(Error::invalid("piece id mismatch between limit, hash and upload"));
        }
        if uplink_hash.hash != computed {
            return Err(Error::integrity(format!(
                "uploaded payload hash {} does not match signed hash {}",
                hex::encode(computed),
                hex::encode(uplink_hash.hash)
            )));
        }
        if uplink_hash.piece_size != self.payload_size {
            return Err(Error::integrity(format!(
                "signed size {} does not match written size {}",
                uplink_hash.piece_size, self.payload_size
            )));
        }
        if order_limit.uplink_public_key.node_id() != order_limit.uplink_id {
            return Err(Error::unauthenticated("uplink key does not match uplink id"));
        }
        uplink_hash.verify_signature(&order_limit.uplink_public_key)?;

        let header = PieceHeader {
            format_version: FORMAT_V1,
            hash_algorithm: HashAlgorithm::Sha256,
            creation_ms: now_ms(),
            uplink_hash: uplink_hash.clone(),
            order_limit: order_limit.clone(),
        };
        let header_bytes = header.to_reserved_bytes()?;

        let mut blob = self
            .blob
            .take()
            .ok_or_else(|| Error::internal("commit after commit"))?;
        blob.rewrite_at(0, &header_bytes)?;
        let total_size = blob.written();

        let lock = self.store.lock_for((self.satellite, self.piece));
        let _guard = lock.lock();
        // a racing commit of the same piece was replaced by this rename;
        // refund its charge so the usage cache tracks the directory
        let blob_ref = PieceStore::blob_ref(&self.satellite, &self.piece);
        if let Ok(existing) = self.store.blobs.open(blob_ref) {
            self.store.monitor.sub(self.satellite, existing.size());
        }
        blob.commit()?;
        self.store.monitor.add(self.satellite, total_size);
        debug!(satellite = %self.satellite, piece = %self.piece, size = self.payload_size, "piece committed");

        Ok(PieceHash::sign(
            node_identity,
            self.piece,
            computed,
            self.payload_size,
            header.creation_ms,
        ))
    }

    /// Abandon the upload and remove the temp file.
    pub fn cancel(mut self) -> Result<()> {
        match self.blob.take() {
            Some(blob) => blob.cancel(),
            None => Ok(()),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// READER
// ════════════════════════════════════════════════════════════════════════════

/// Random-access reader over one committed piece's payload.
#[derive(Debug)]
pub struct PieceReader {
    blob: BlobReader,
    header: PieceHeader,
    payload_offset: u64,
    payload_size: u64,
}

impl PieceReader {
    #[must_use]
    pub fn header(&self) -> &PieceHeader {
        &self.header
    }

    #[must_use]
    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// Read `len` payload bytes at payload `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.payload_size {
            return Err(Error::invalid(format!(
                "read [{}, {}) beyond payload size {}",
                offset,
                offset + len as u64,
                self.payload_size
            )));
        }
        self.blob.read_at(self.payload_offset + offset, len)
    }

    /// SHA-256 over the full payload, for content verification sweeps.
    pub fn payload_hash(&mut self) -> Result<[u8; 32]> {
        let payload = self.blob.read_to_end_from(self.payload_offset)?;
        let mut hasher = Sha256::new();
        Digest::update(&mut hasher, &payload);
        Ok(hasher.finalize().into())
    }
}
