//! Dialing storage nodes.
//!
//! Audit and repair reach storage nodes through [`PieceTransport`]. The
//! error variants matter as much as the success path: the audit worker
//! classifies a node as offline, failed or contained purely from which
//! variant came back, so implementations must keep the distinctions honest:
//!
//! | Variant            | Meaning                               | Audit class |
//! |--------------------|---------------------------------------|-------------|
//! | `DialTimeout`      | no connection within the dial budget  | offline     |
//! | `DialFailed`       | connection refused / unreachable      | offline     |
//! | `Timeout`          | connected, then the transfer stalled  | contained   |
//! | `NotFound`         | node answered: no such piece          | fail        |
//! | `PermissionDenied` | node rejected the order limit         | contained   |
//! | `Other`            | anything else                         | contained   |
//!
//! [`RemoteTransport`] is the production dialer: framed requests over TCP
//! (TLS in deployment terminates in front of the same framing).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

use orbit_common::orders::{Order, OrderLimit, PieceHash};
use orbit_proto::{
    read_frame, write_frame, ErrorClass, GcSummary, PieceRequest, PieceResponse, SignedRetain,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial timed out")]
    DialTimeout,

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("transfer timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transport: {0}")]
    Other(String),
}

impl TransportError {
    /// True when the node never answered at all.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        matches!(self, TransportError::DialTimeout | TransportError::DialFailed(_))
    }
}

/// The data-plane client surface used by the audit and repair workers.
#[async_trait]
pub trait PieceTransport: Send + Sync {
    async fn download(
        &self,
        address: &str,
        limit: &OrderLimit,
        order: &Order,
        offset: u64,
        length: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    async fn upload(
        &self,
        address: &str,
        limit: &OrderLimit,
        uplink_hash: &PieceHash,
        payload: &[u8],
        order: &Order,
        timeout: Duration,
    ) -> Result<PieceHash, TransportError>;

    async fn delete(
        &self,
        address: &str,
        limit: &OrderLimit,
        timeout: Duration,
    ) -> Result<bool, TransportError>;

    async fn retain(
        &self,
        address: &str,
        request: &SignedRetain,
        timeout: Duration,
    ) -> Result<GcSummary, TransportError>;
}

// ════════════════════════════════════════════════════════════════════════════
// REMOTE TRANSPORT
// ════════════════════════════════════════════════════════════════════════════

/// Framed-TCP dialer.
#[derive(Debug, Clone)]
pub struct RemoteTransport {
    dial_timeout: Duration,
}

impl Default for RemoteTransport {
    fn default() -> Self {
        RemoteTransport {
            dial_timeout: Duration::from_secs(20),
        }
    }
}

impl RemoteTransport {
    #[must_use]
    pub fn new(dial_timeout: Duration) -> Self {
        RemoteTransport { dial_timeout }
    }

    async fn round_trip(
        &self,
        address: &str,
        request: &PieceRequest,
        timeout: Duration,
    ) -> Result<PieceResponse, TransportError> {
        let mut stream = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(address)).await
        {
            Err(_) => return Err(TransportError::DialTimeout),
            Ok(Err(e)) => return Err(TransportError::DialFailed(e.to_string())),
            Ok(Ok(stream)) => stream,
        };

        let exchange = async {
            write_frame(&mut stream, request)
                .await
                .map_err(|e| TransportError::Other(format!("send: {}", e)))?;
            read_frame::<_, PieceResponse>(&mut stream)
                .await
                .map_err(|e| TransportError::Other(format!("recv: {}", e)))
        };
        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(result) => result,
        }
    }
}

fn classify_wire_error(class: ErrorClass, message: String) -> TransportError {
    match class {
        ErrorClass::NotFound => TransportError::NotFound(message),
        ErrorClass::PermissionDenied | ErrorClass::Unauthenticated => {
            TransportError::PermissionDenied(message)
        }
        _ => TransportError::Other(message),
    }
}

#[async_trait]
impl PieceTransport for RemoteTransport {
    async fn download(
        &self,
        address: &str,
        limit: &OrderLimit,
        order: &Order,
        offset: u64,
        length: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let request = PieceRequest::Download {
            limit: limit.clone(),
            order: order.clone(),
            offset,
            length,
        };
        match self.round_trip(address, &request, timeout).await? {
            PieceResponse::Data(bytes) => Ok(bytes),
            PieceResponse::Error { class, message } => Err(classify_wire_error(class, message)),
            other => Err(TransportError::Other(format!("unexpected response {:?}", other))),
        }
    }

    async fn upload(
        &self,
        address: &str,
        limit: &OrderLimit,
        uplink_hash: &PieceHash,
        payload: &[u8],
        order: &Order,
        timeout: Duration,
    ) -> Result<PieceHash, TransportError> {
        let request = PieceRequest::Upload {
            limit: limit.clone(),
            uplink_hash: uplink_hash.clone(),
            payload: payload.to_vec(),
            order: order.clone(),
        };
        match self.round_trip(address, &request, timeout).await? {
            PieceResponse::Uploaded(hash) => Ok(hash),
            PieceResponse::Error { class, message } => Err(classify_wire_error(class, message)),
            other => Err(TransportError::Other(format!("unexpected response {:?}", other))),
        }
    }

    async fn delete(
        &self,
        address: &str,
        limit: &OrderLimit,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        let request = PieceRequest::Delete {
            limit: limit.clone(),
            strict: false,
        };
        match self.round_trip(address, &request, timeout).await? {
            PieceResponse::Deleted(removed) => Ok(removed),
            PieceResponse::Error { class, message } => Err(classify_wire_error(class, message)),
            other => Err(TransportError::Other(format!("unexpected response {:?}", other))),
        }
    }

    async fn retain(
        &self,
        address: &str,
        request: &SignedRetain,
        timeout: Duration,
    ) -> Result<GcSummary, TransportError> {
        let request = PieceRequest::Retain(request.clone());
        match self.round_trip(address, &request, timeout).await? {
            PieceResponse::Retained(summary) => Ok(summary),
            PieceResponse::Error { class, message } => Err(classify_wire_error(class, message)),
            other => Err(TransportError::Other(format!("unexpected response {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_classification() {
        assert!(TransportError::DialTimeout.is_offline());
        assert!(TransportError::DialFailed("refused".into()).is_offline());
        assert!(!TransportError::Timeout.is_offline());
        assert!(!TransportError::NotFound("piece".into()).is_offline());
    }

    #[tokio::test]
    async fn test_dial_failed_against_closed_port() {
        // bind then drop to get a port with no listener
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let transport = RemoteTransport::default();
        let limit_err = transport
            .delete(&addr, &dummy_limit(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(limit_err.is_offline(), "got {:?}", limit_err);
    }

    fn dummy_limit() -> OrderLimit {
        use orbit_common::id::{PieceId, SerialNumber};
        use orbit_common::identity::{Identity, Signature};
        use orbit_common::orders::Action;
        let id = Identity::generate();
        OrderLimit {
            serial: SerialNumber::generate(),
            satellite_id: id.node_id(),
            uplink_id: id.node_id(),
            storage_id: id.node_id(),
            piece_id: PieceId::generate(),
            uplink_public_key: id.public_key(),
            action: Action::Delete,
            limit: 0,
            piece_expiration_ms: None,
            order_expiration_ms: 0,
            satellite_signature: Signature(vec![0; 64]),
        }
    }
}
