//! On-disk blob store.
//!
//! Blobs are opaque byte files keyed by `(namespace, key)` — for Orbit, the
//! satellite id and the derived piece id. Layout:
//!
//! ```text
//! <root>/blobs/<ns[0]>/<ns[1..]>/<key[0]>/<key[1..]>.sj1
//! <root>/temp/<key>.tmp.<seq>
//! <root>/quarantine/<ns>-<key>.sj1
//! ```
//!
//! Directory components are lowercase hex; the single leading byte of
//! namespace and key fans entries out across 256 directories each, bounding
//! per-directory entry counts.
//!
//! Writes are create-then-commit: bytes stream into a temp file, `commit`
//! fsyncs, renames into place and fsyncs the parent directory. A crash
//! before commit leaves only temp garbage; a torn rename is surfaced to the
//! layer above as a header that fails verification, and `quarantine` moves
//! such files aside for the garbage sweep to report and reclaim.

pub mod store;

pub use store::{BlobInfo, BlobReader, BlobRef, BlobStore, BlobWriter, FileStore};
