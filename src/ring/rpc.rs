//! Wire messages and TCP transport for forwarded resource operations.
//!
//! Forwarded operations are length-prefixed JSON frames: resources carry
//! arbitrary caller-defined JSON fields, so the body encoding must be
//! self-describing. Each forward is a single request/response exchange over
//! a fresh connection.

use crate::error::{BootstrapError, ForwardError};
use crate::types::{Resource, ResourceOp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Maximum accepted frame size.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Network message wrapper for ring RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// A forwarded resource operation.
    Forward(ForwardRequest),

    /// Response to a forwarded operation.
    ForwardResponse(ForwardResponse),
}

/// A resource operation forwarded to the owning node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// The sender's ring checksum; receivers reject on mismatch.
    pub ring_checksum: u64,

    /// The operation to apply.
    pub op: ResourceOp,

    /// The resource payload.
    pub resource: Resource,
}

/// Response to a forwarded operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardResponse {
    /// Whether the operation was accepted.
    pub success: bool,

    /// Error description when rejected.
    pub error: Option<String>,

    /// Set when the rejection was a ring checksum mismatch, so the sender
    /// can distinguish a divergent ring view from an execution failure.
    pub checksum_mismatch: bool,
}

impl ForwardResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            checksum_mismatch: false,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            checksum_mismatch: false,
        }
    }

    pub fn checksum_mismatch() -> Self {
        Self {
            success: false,
            error: Some("ring checksum mismatch".to_string()),
            checksum_mismatch: true,
        }
    }
}

/// Encode a message to a JSON body.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ForwardError> {
    serde_json::to_vec(msg).map_err(|e| ForwardError::Codec(e.to_string()))
}

/// Decode a message from a JSON body.
pub fn decode_message(data: &[u8]) -> Result<Message, ForwardError> {
    serde_json::from_slice(data).map_err(|e| ForwardError::Codec(e.to_string()))
}

/// Write a message as a 4-byte big-endian length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), ForwardError> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    writer
        .write_all(&framed)
        .await
        .map_err(|e| ForwardError::Codec(format!("write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| ForwardError::Codec(format!("flush failed: {}", e)))?;
    Ok(())
}

/// Read one length-prefixed frame and decode it.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ForwardError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ForwardError::Codec(format!("read length failed: {}", e)))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ForwardError::Codec(format!("frame too large: {}", len)));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| ForwardError::Codec(format!("read body failed: {}", e)))?;

    decode_message(&buf)
}

/// Local execution seam for operations arriving over the ring.
#[async_trait]
pub trait ForwardTarget: Send + Sync + 'static {
    /// The local ring checksum, for request validation.
    fn ring_checksum(&self) -> u64;

    /// Apply a forwarded operation locally. An `Err` travels back to the
    /// sender as a rejected response.
    async fn apply(&self, op: ResourceOp, resource: Resource) -> Result<(), String>;
}

/// TCP server accepting forwarded resource operations.
pub struct RpcServer {
    listener: TcpListener,
    target: Arc<dyn ForwardTarget>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl RpcServer {
    /// Bind the listener. Binding eagerly lets bootstrap fail before the node
    /// joins the gossip ring.
    pub async fn bind(
        addr: SocketAddr,
        target: Arc<dyn ForwardTarget>,
    ) -> Result<(Self, mpsc::Sender<()>), BootstrapError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| BootstrapError::RpcBind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok((
            Self {
                listener,
                target,
                shutdown_rx,
            },
            shutdown_tx,
        ))
    }

    /// The bound address (relevant when binding port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the shutdown channel fires or closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let target = self.target.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, target).await {
                                    debug!(peer = %peer, error = %e, "Ring RPC connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Ring RPC accept failed");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    debug!("Ring RPC server shutting down");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    target: Arc<dyn ForwardTarget>,
) -> Result<(), ForwardError> {
    let msg = read_frame(&mut stream).await?;

    let response = match msg {
        Message::Forward(req) => {
            let local_checksum = target.ring_checksum();
            if req.ring_checksum != local_checksum {
                warn!(
                    remote_checksum = req.ring_checksum,
                    local_checksum,
                    resource_id = %req.resource.id,
                    "Rejecting forwarded operation: ring checksum mismatch"
                );
                ForwardResponse::checksum_mismatch()
            } else {
                debug!(
                    resource_id = %req.resource.id,
                    op = %req.op,
                    "Applying forwarded operation"
                );
                match target.apply(req.op, req.resource).await {
                    Ok(()) => ForwardResponse::ok(),
                    Err(reason) => ForwardResponse::rejected(reason),
                }
            }
        }
        Message::ForwardResponse(_) => ForwardResponse::rejected("unexpected message type"),
    };

    write_frame(&mut stream, &Message::ForwardResponse(response)).await
}

/// Send one forwarded operation to `addr` and wait for the response.
pub async fn send_forward(
    addr: SocketAddr,
    request: ForwardRequest,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Result<ForwardResponse, ForwardError> {
    let exchange = async {
        let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ForwardError::Unreachable {
                addr: addr.to_string(),
                reason: "connect timeout".to_string(),
            })?
            .map_err(|e| ForwardError::Unreachable {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        write_frame(&mut stream, &Message::Forward(request)).await?;

        match read_frame(&mut stream).await? {
            Message::ForwardResponse(resp) => Ok(resp),
            Message::Forward(_) => Err(ForwardError::Codec(
                "unexpected request frame in response".to_string(),
            )),
        }
    };

    tokio::time::timeout(request_timeout, exchange)
        .await
        .map_err(|_| ForwardError::Timeout {
            addr: addr.to_string(),
        })?
}
