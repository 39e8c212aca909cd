use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use orbit_common::error::{Error, Result};
use orbit_common::time::now_ms;

/// Blob address: a 32-byte namespace (satellite id) and a 32-byte key
/// (derived piece id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub namespace: [u8; 32],
    pub key: [u8; 32],
}

/// Listing entry for one stored blob.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub key: [u8; 32],
    pub size: u64,
    /// Commit time (file mtime) in Unix milliseconds.
    pub modified_ms: u64,
}

/// Storage backend contract. The piece layer is written against this trait
/// so tests can substitute an in-memory store.
pub trait BlobStore: Send + Sync + 'static {
    /// Open a temp-backed writer. `size_hint` preallocates only; writing
    /// more than the hint is not an error.
    fn create(&self, blob_ref: BlobRef, size_hint: Option<u64>) -> Result<BlobWriter>;

    fn open(&self, blob_ref: BlobRef) -> Result<BlobReader>;

    /// Idempotent unlink. Returns `true` if a file was removed.
    fn delete(&self, blob_ref: BlobRef) -> Result<bool>;

    /// Move a blob aside so the sweep can report it without re-serving it.
    fn quarantine(&self, blob_ref: BlobRef) -> Result<()>;

    /// All blobs under a namespace. Order is unspecified.
    fn list(&self, namespace: &[u8; 32]) -> Result<Vec<BlobInfo>>;
}

// ════════════════════════════════════════════════════════════════════════════
// FILE STORE
// ════════════════════════════════════════════════════════════════════════════

const BLOB_EXT: &str = "sj1";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Local-filesystem blob store rooted at one directory.
#[derive(Debug)]
pub struct FileStore {
    blobs_dir: PathBuf,
    temp_dir: PathBuf,
    quarantine_dir: PathBuf,
}

impl FileStore {
    /// Create the store, making `blobs`, `temp` and `quarantine` under
    /// `root` if missing. Leftover temp files from a previous crash are
    /// removed here.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let store = FileStore {
            blobs_dir: root.join("blobs"),
            temp_dir: root.join("temp"),
            quarantine_dir: root.join("quarantine"),
        };
        fs::create_dir_all(&store.blobs_dir)?;
        fs::create_dir_all(&store.temp_dir)?;
        fs::create_dir_all(&store.quarantine_dir)?;
        store.sweep_temp();
        Ok(store)
    }

    fn sweep_temp(&self) {
        let entries = match fs::read_dir(&self.temp_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("temp sweep: cannot read {}: {}", self.temp_dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("temp sweep: cannot remove {:?}: {}", entry.path(), e);
            } else {
                debug!("temp sweep: removed stale {:?}", entry.file_name());
            }
        }
    }

    fn blob_path(&self, blob_ref: &BlobRef) -> PathBuf {
        self.blobs_dir
            .join(hex::encode(&blob_ref.namespace[..1]))
            .join(hex::encode(&blob_ref.namespace[1..]))
            .join(hex::encode(&blob_ref.key[..1]))
            .join(format!("{}.{}", hex::encode(&blob_ref.key[1..]), BLOB_EXT))
    }

    fn temp_path(&self, blob_ref: &BlobRef) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.temp_dir.join(format!(
            "{}.tmp.{}.{}",
            hex::encode(&blob_ref.key[..8]),
            now_ms(),
            seq
        ))
    }
}

impl BlobStore for FileStore {
    fn create(&self, blob_ref: BlobRef, size_hint: Option<u64>) -> Result<BlobWriter> {
        let temp_path = self.temp_path(&blob_ref);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        if let Some(hint) = size_hint {
            // preallocation only; the commit truncates to the written length
            let _ = file.set_len(hint);
        }
        Ok(BlobWriter {
            file,
            temp_path,
            final_path: self.blob_path(&blob_ref),
            written: 0,
        })
    }

    fn open(&self, blob_ref: BlobRef) -> Result<BlobReader> {
        let path = self.blob_path(&blob_ref);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("blob {}", hex::encode(blob_ref.key)))
            } else {
                Error::Io(e)
            }
        })?;
        let size = file.metadata()?.len();
        Ok(BlobReader { file, size })
    }

    fn delete(&self, blob_ref: BlobRef) -> Result<bool> {
        match fs::remove_file(self.blob_path(&blob_ref)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn quarantine(&self, blob_ref: BlobRef) -> Result<()> {
        let src = self.blob_path(&blob_ref);
        let dst = self.quarantine_dir.join(format!(
            "{}-{}.{}",
            hex::encode(blob_ref.namespace),
            hex::encode(blob_ref.key),
            BLOB_EXT
        ));
        fs::rename(&src, &dst)?;
        warn!("quarantined blob {}", hex::encode(blob_ref.key));
        Ok(())
    }

    fn list(&self, namespace: &[u8; 32]) -> Result<Vec<BlobInfo>> {
        let ns_dir = self
            .blobs_dir
            .join(hex::encode(&namespace[..1]))
            .join(hex::encode(&namespace[1..]));
        let mut out = Vec::new();
        let fan_dirs = match fs::read_dir(&ns_dir) {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::Io(e)),
        };
        for fan in fan_dirs.flatten() {
            let fan_name = fan.file_name();
            let fan_hex = fan_name.to_string_lossy();
            let prefix = match hex::decode(fan_hex.as_bytes()) {
                Ok(b) if b.len() == 1 => b,
                _ => continue,
            };
            for entry in fs::read_dir(fan.path())?.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let stem = match name.strip_suffix(&format!(".{}", BLOB_EXT)) {
                    Some(stem) => stem,
                    None => continue,
                };
                let rest = match hex::decode(stem) {
                    Ok(b) if b.len() == 31 => b,
                    _ => continue,
                };
                let mut key = [0u8; 32];
                key[0] = prefix[0];
                key[1..].copy_from_slice(&rest);

                let meta = entry.metadata()?;
                let modified_ms = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                out.push(BlobInfo {
                    key,
                    size: meta.len(),
                    modified_ms,
                });
            }
        }
        Ok(out)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// WRITER / READER
// ════════════════════════════════════════════════════════════════════════════

/// Temp-file-backed writer. Dropping without `commit` leaves only temp
/// garbage, which the next store startup sweeps.
#[derive(Debug)]
pub struct BlobWriter {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

impl BlobWriter {
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Overwrite bytes inside the already-written region, leaving the append
    /// cursor at the end. Used to fill a reserved header region at commit.
    pub fn rewrite_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.written {
            return Err(Error::invalid("rewrite_at beyond written region"));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        self.file.seek(SeekFrom::Start(self.written))?;
        Ok(())
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Fsync, rename into place, fsync the parent directory.
    pub fn commit(self) -> Result<()> {
        self.file.set_len(self.written)?;
        self.file.sync_all()?;
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.temp_path, &self.final_path)?;
        if let Some(parent) = self.final_path.parent() {
            // the rename itself must survive power loss
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    /// Remove the temp file without committing.
    pub fn cancel(self) -> Result<()> {
        match fs::remove_file(&self.temp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Random-access reader over one committed blob. Each reader owns its file
/// handle, so readers never block each other.
#[derive(Debug)]
pub struct BlobReader {
    file: File,
    size: u64,
}

impl BlobReader {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read exactly `len` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.size {
            return Err(Error::invalid(format!(
                "read [{}, {}) beyond blob size {}",
                offset,
                offset + len as u64,
                self.size
            )));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read from `offset` to the end.
    pub fn read_to_end_from(&mut self, offset: u64) -> Result<Vec<u8>> {
        self.read_at(offset, (self.size.saturating_sub(offset)) as usize)
    }
}
