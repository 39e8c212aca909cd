//! TCP piecestore server.
//!
//! One framed request per connection, one framed response back. The heavy
//! lifting (signature checks, disk) runs on the blocking pool; the accept
//! loop stays responsive. Authorization lives entirely in the endpoint: a
//! request is honored exactly when its order limit (or retain signature)
//! verifies, so the listener itself accepts from anyone.
//!
//! The deployment build terminates mutually-authenticated TLS in front of
//! this loop; the framing and dispatch are identical.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use orbit_common::error::{Error, Result};
use orbit_proto::{read_frame, write_frame, PieceRequest, PieceResponse};

use crate::endpoint::NodeEndpoint;

/// Handle one already-decoded request. Pure dispatch; shared by the TCP
/// loop and in-process tests.
pub fn handle_request(endpoint: &NodeEndpoint, request: PieceRequest) -> PieceResponse {
    let result: Result<PieceResponse> = (|| match request {
        PieceRequest::Upload {
            limit,
            uplink_hash,
            payload,
            order,
        } => {
            let node_hash = endpoint.upload(&limit, &uplink_hash, &payload, &order)?;
            Ok(PieceResponse::Uploaded(node_hash))
        }
        PieceRequest::Download {
            limit,
            order,
            offset,
            length,
        } => {
            let bytes = endpoint.download(&limit, offset, length, &order)?;
            Ok(PieceResponse::Data(bytes))
        }
        PieceRequest::Delete { limit, strict } => {
            let removed = endpoint.delete(&limit, strict)?;
            Ok(PieceResponse::Deleted(removed))
        }
        PieceRequest::Retain(signed) => {
            let summary = endpoint.apply_signed_retain(&signed)?;
            Ok(PieceResponse::Retained(summary))
        }
    })();

    match result {
        Ok(response) => response,
        Err(err) => {
            debug!(%err, "request refused");
            PieceResponse::from_error(&err)
        }
    }
}

async fn handle_conn(endpoint: NodeEndpoint, mut stream: TcpStream) -> Result<()> {
    let request: PieceRequest = read_frame(&mut stream)
        .await
        .map_err(|e| Error::invalid(format!("bad request frame: {}", e)))?;

    let response = tokio::task::spawn_blocking(move || handle_request(&endpoint, request))
        .await
        .map_err(|e| Error::internal(format!("handler task: {}", e)))?;

    write_frame(&mut stream, &response)
        .await
        .map_err(|e| Error::unavailable(format!("response write: {}", e)))?;
    Ok(())
}

/// Accept loop. Runs until `shutdown` is notified.
pub async fn serve(
    endpoint: NodeEndpoint,
    listener: TcpListener,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let local: SocketAddr = listener.local_addr()?;
    info!(%local, node_id = %endpoint.node_id(), "piecestore listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let endpoint = endpoint.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(endpoint, stream).await {
                        warn!(%peer, %err, "connection failed");
                    }
                });
            }
            _ = shutdown.notified() => {
                info!(%local, "piecestore shutting down");
                return Ok(());
            }
        }
    }
}
