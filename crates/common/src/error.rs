//! Shared error taxonomy.
//!
//! Every subsystem maps its internal failures into this small set of stable
//! classes before the error crosses a crate boundary. RPC surfaces translate
//! these classes one-to-one; internal detail never leaks to clients.
//!
//! ## Classes
//!
//! | Class             | Meaning                                          | Caller action    |
//! |-------------------|--------------------------------------------------|------------------|
//! | Invalid           | malformed request / precondition violated        | permanent        |
//! | Unauthenticated   | signature invalid or identity mismatch           | permanent        |
//! | PermissionDenied  | untrusted satellite, expired order               | permanent        |
//! | NotFound          | pointer, piece or node unknown                   | permanent        |
//! | ResourceExhausted | storage or bandwidth quota hit                   | back off         |
//! | Unavailable       | transient transport or timeout                   | retry w/ jitter  |
//! | Integrity         | hash mismatch, content does not match signature  | piece is fatal   |
//! | Corrupt           | internal invariant violated                      | abort op, alert  |
//! | Internal          | unexpected condition                             | permanent        |

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid: {0}")]
    Invalid(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("integrity: {0}")]
    Integrity(String),

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Error::Unauthenticated(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Error::PermissionDenied(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for classes a caller may retry (with jitter, bounded budget).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::ResourceExhausted(_))
    }

    /// True when the error means the referenced entity does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
            || matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
