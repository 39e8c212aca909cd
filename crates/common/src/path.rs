//! Byte-safe segment paths.
//!
//! A segment path names one segment of one object:
//!
//! ```text
//! <project>/<segment>/<bucket>/<encrypted path>
//! ```
//!
//! where `<segment>` is `l` for the last segment or `s<index>` for an
//! intermediate one. The encrypted path is opaque client ciphertext and may
//! contain any bytes including `/` and NUL, so the path is a byte vector and
//! the pointer store must be byte-safe, never text-safe. Only the first three
//! components are split on `/`; everything after the third separator belongs
//! to the encrypted path verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Segment selector within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentRef {
    /// The `l` segment, rewritten at object commit with stream metadata.
    Last,
    /// `s<index>` intermediate segment.
    Index(u32),
}

impl SegmentRef {
    fn encode(self, out: &mut Vec<u8>) {
        match self {
            SegmentRef::Last => out.push(b'l'),
            SegmentRef::Index(i) => {
                out.push(b's');
                out.extend_from_slice(i.to_string().as_bytes());
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        match bytes.split_first() {
            Some((b'l', rest)) if rest.is_empty() => Ok(SegmentRef::Last),
            Some((b's', rest)) if !rest.is_empty() => {
                let s = std::str::from_utf8(rest)
                    .map_err(|_| Error::invalid("segment index is not ascii"))?;
                let index: u32 = s
                    .parse()
                    .map_err(|_| Error::invalid("segment index is not a number"))?;
                Ok(SegmentRef::Index(index))
            }
            _ => Err(Error::invalid("segment component must be 'l' or 's<index>'")),
        }
    }
}

impl fmt::Display for SegmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentRef::Last => write!(f, "l"),
            SegmentRef::Index(i) => write!(f, "s{}", i),
        }
    }
}

/// Opaque, byte-safe segment path. Ordered and hashable so it can key the
/// pointer store and the repair queue directly.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentPath(Vec<u8>);

impl SegmentPath {
    /// Assemble a path from components. `project` and `bucket` must not
    /// contain `/`; the encrypted path may contain anything.
    pub fn new(
        project: &str,
        segment: SegmentRef,
        bucket: &str,
        encrypted_path: &[u8],
    ) -> Result<Self, Error> {
        if project.is_empty() || project.contains('/') {
            return Err(Error::invalid("project id must be non-empty without '/'"));
        }
        if bucket.is_empty() || bucket.contains('/') {
            return Err(Error::invalid("bucket must be non-empty without '/'"));
        }
        let mut out = Vec::with_capacity(project.len() + bucket.len() + encrypted_path.len() + 8);
        out.extend_from_slice(project.as_bytes());
        out.push(b'/');
        segment.encode(&mut out);
        out.push(b'/');
        out.extend_from_slice(bucket.as_bytes());
        out.push(b'/');
        out.extend_from_slice(encrypted_path);
        Ok(SegmentPath(out))
    }

    /// Wrap raw key bytes without validation; used by store iteration.
    #[must_use]
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        SegmentPath(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Split into (project, segment, bucket, encrypted path).
    pub fn components(&self) -> Result<(&[u8], SegmentRef, &[u8], &[u8]), Error> {
        let mut parts = self.0.splitn(4, |&b| b == b'/');
        let project = parts.next().filter(|p| !p.is_empty());
        let segment = parts.next();
        let bucket = parts.next().filter(|p| !p.is_empty());
        let encrypted = parts.next();
        match (project, segment, bucket, encrypted) {
            (Some(p), Some(s), Some(b), Some(e)) => Ok((p, SegmentRef::decode(s)?, b, e)),
            _ => Err(Error::invalid("segment path needs 4 components")),
        }
    }

    pub fn segment(&self) -> Result<SegmentRef, Error> {
        self.components().map(|(_, s, _, _)| s)
    }

    /// The same object path addressed at a different segment.
    pub fn with_segment(&self, segment: SegmentRef) -> Result<SegmentPath, Error> {
        let (project, _, bucket, encrypted) = self.components()?;
        let mut out = Vec::with_capacity(self.0.len() + 4);
        out.extend_from_slice(project);
        out.push(b'/');
        segment.encode(&mut out);
        out.push(b'/');
        out.extend_from_slice(bucket);
        out.push(b'/');
        out.extend_from_slice(encrypted);
        Ok(SegmentPath(out))
    }

    /// `project/bucket` prefix used for per-bucket accounting keys.
    pub fn bucket_id(&self) -> Result<Vec<u8>, Error> {
        let (project, _, bucket, _) = self.components()?;
        let mut out = Vec::with_capacity(project.len() + bucket.len() + 1);
        out.extend_from_slice(project);
        out.push(b'/');
        out.extend_from_slice(bucket);
        Ok(out)
    }
}

impl fmt::Display for SegmentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // lossy form for logs only; raw bytes stay authoritative
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for SegmentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentPath({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_components() {
        let path = SegmentPath::new("proj", SegmentRef::Index(3), "bucket", b"enc/p\x00ath")
            .expect("path");
        let (project, segment, bucket, encrypted) = path.components().expect("components");
        assert_eq!(project, b"proj");
        assert_eq!(segment, SegmentRef::Index(3));
        assert_eq!(bucket, b"bucket");
        assert_eq!(encrypted, b"enc/p\x00ath");
    }

    #[test]
    fn test_encrypted_path_keeps_slashes_and_binary() {
        let raw = [b'/', 0x00, 0xff, b'/', b'/'];
        let path = SegmentPath::new("p", SegmentRef::Last, "b", &raw).expect("path");
        let (_, _, _, encrypted) = path.components().expect("components");
        assert_eq!(encrypted, raw);
    }

    #[test]
    fn test_with_segment_rewrites_only_segment() {
        let last = SegmentPath::new("p", SegmentRef::Last, "b", b"obj").expect("path");
        let s0 = last.with_segment(SegmentRef::Index(0)).expect("s0");
        assert_eq!(s0.as_bytes(), b"p/s0/b/obj");
        assert_eq!(
            s0.with_segment(SegmentRef::Last).expect("l").as_bytes(),
            last.as_bytes()
        );
    }

    #[test]
    fn test_invalid_components_rejected() {
        assert!(SegmentPath::new("a/b", SegmentRef::Last, "b", b"x").is_err());
        assert!(SegmentPath::new("p", SegmentRef::Last, "", b"x").is_err());
        assert!(SegmentPath::from_raw(b"p/zz/b/x".to_vec()).segment().is_err());
        assert!(SegmentPath::from_raw(b"noslashes".to_vec()).components().is_err());
    }

    #[test]
    fn test_bucket_id() {
        let path = SegmentPath::new("proj", SegmentRef::Index(1), "bkt", b"e").expect("path");
        assert_eq!(path.bucket_id().expect("bucket id"), b"proj/bkt");
    }
}
