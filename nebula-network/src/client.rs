//! Piece transport client
//!
//! Every call opens its own TCP connection to the storage node, performs one
//! exchange and closes it. Nothing is pooled and nothing is retried: a
//! failed call is reported to the caller, which decides what a missing piece
//! means.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use nebula_core::{NebulaError, Result, STREAM_FRAME_SIZE};
use nebula_protocol::{
    ClientCodec, ClientMessage, InspectRequest, NodeMessage, NodeProof, PieceAuthorization,
    PieceRef, PingRequest, RetrieveRequest, StoreHeader, DEFAULT_MAX_FRAME_LENGTH,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

/// Receives the cumulative number of bytes sent for one piece.
///
/// Implementations must return quickly; they run on the transfer task.
pub trait ProgressSink: Send + Sync {
    fn report(&self, bytes: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64) + Send + Sync,
{
    fn report(&self, bytes: u64) {
        self(bytes)
    }
}

/// Configuration for the piece client
#[derive(Debug, Clone)]
pub struct PieceClientConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Bound on each frame read or write
    pub io_timeout: Duration,
    /// Payload bytes per data frame
    pub frame_size: usize,
    /// Maximum accepted frame length
    pub max_frame_length: usize,
}

impl Default for PieceClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            frame_size: STREAM_FRAME_SIZE,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Result of an inspect call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceStatus {
    pub exists: bool,
    pub size: u64,
}

type ClientFramed = Framed<TcpStream, ClientCodec>;

/// Client for the storage-node piece protocol
#[derive(Debug, Clone, Default)]
pub struct PieceClient {
    config: PieceClientConfig,
}

impl PieceClient {
    /// Create a new PieceClient with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new PieceClient with custom configuration
    pub fn with_config(config: PieceClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PieceClientConfig {
        &self.config
    }

    async fn connect(&self, endpoint: &str) -> Result<ClientFramed> {
        let connect = TcpStream::connect(endpoint);
        let stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NebulaError::Transport(format!(
                    "connection to {} failed: {}",
                    endpoint, e
                )))
            }
            Err(_) => {
                return Err(NebulaError::ConnectionTimeout {
                    peer: endpoint.to_string(),
                })
            }
        };
        stream.set_nodelay(true)?;
        let codec = ClientCodec::with_max_frame_length(self.config.max_frame_length);
        Ok(Framed::new(stream, codec))
    }

    async fn send(&self, framed: &mut ClientFramed, message: ClientMessage) -> Result<()> {
        match tokio::time::timeout(self.config.io_timeout, framed.send(message)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(NebulaError::Transport("timed out writing frame".to_string())),
        }
    }

    async fn recv(&self, framed: &mut ClientFramed) -> Result<Option<NodeMessage>> {
        match tokio::time::timeout(self.config.io_timeout, framed.next()).await {
            Ok(Some(message)) => Ok(Some(message?)),
            Ok(None) => Ok(None),
            Err(_) => Err(NebulaError::Transport("timed out reading frame".to_string())),
        }
    }

    /// A write failed: if the node already explained why, prefer its reason.
    async fn explain_send_failure(
        &self,
        framed: &mut ClientFramed,
        err: NebulaError,
    ) -> NebulaError {
        match tokio::time::timeout(self.config.io_timeout, framed.next()).await {
            Ok(Some(Ok(NodeMessage::Rejected { reason }))) => NebulaError::RemoteRejected(reason),
            Ok(Some(Ok(NodeMessage::StoreAck {
                success: false,
                error,
            }))) => {
                NebulaError::RemoteRejected(error.unwrap_or_else(|| "store refused".to_string()))
            }
            _ => err,
        }
    }

    /// Stream `piece.size` bytes from `source` to the node.
    ///
    /// Succeeds only on an explicit positive acknowledgement.
    #[instrument(
        skip(self, authz, source, progress),
        fields(endpoint = %endpoint, key = %piece.key, size = piece.size)
    )]
    pub async fn store_piece<R>(
        &self,
        endpoint: &str,
        piece: &PieceRef,
        authz: &PieceAuthorization,
        mut source: R,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut framed = self.connect(endpoint).await?;
        let header = ClientMessage::Store(StoreHeader {
            piece: *piece,
            authz: authz.clone(),
        });
        if let Err(e) = self.send(&mut framed, header).await {
            return Err(self.explain_send_failure(&mut framed, e).await);
        }

        let frame_size = self.config.frame_size.max(1);
        let mut sent: u64 = 0;
        while sent < piece.size {
            let want = (piece.size - sent).min(frame_size as u64) as usize;
            let mut buf = BytesMut::zeroed(want);
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Err(NebulaError::ShortStream {
                    expected: piece.size,
                    actual: sent,
                });
            }
            buf.truncate(n);

            if let Err(e) = self.send(&mut framed, ClientMessage::Data(buf.freeze())).await {
                return Err(self.explain_send_failure(&mut framed, e).await);
            }
            sent += n as u64;
            if let Some(sink) = progress {
                sink.report(sent);
            }
        }

        match self.recv(&mut framed).await? {
            Some(NodeMessage::StoreAck { success: true, .. }) => {
                debug!("Piece stored");
                Ok(())
            }
            Some(NodeMessage::StoreAck { error, .. }) => Err(NebulaError::RemoteRejected(
                error.unwrap_or_else(|| "store refused".to_string()),
            )),
            Some(NodeMessage::Rejected { reason }) => Err(NebulaError::RemoteRejected(reason)),
            Some(other) => Err(unexpected("store acknowledgement", &other)),
            None => Err(NebulaError::Transport(
                "connection closed before store acknowledgement".to_string(),
            )),
        }
    }

    /// Fetch a piece; fewer than `piece.size` bytes is a `ShortStream` error.
    #[instrument(
        skip(self, authz),
        fields(endpoint = %endpoint, key = %piece.key, size = piece.size)
    )]
    pub async fn retrieve_piece(
        &self,
        endpoint: &str,
        piece: &PieceRef,
        authz: &PieceAuthorization,
    ) -> Result<Bytes> {
        let mut framed = self.connect(endpoint).await?;
        let request = ClientMessage::Retrieve(RetrieveRequest {
            piece: *piece,
            authz: authz.clone(),
        });
        self.send(&mut framed, request).await?;

        let mut buf = BytesMut::new();
        while (buf.len() as u64) < piece.size {
            match self.recv(&mut framed).await? {
                Some(NodeMessage::Data(frame)) if frame.is_empty() => break,
                Some(NodeMessage::Data(frame)) => {
                    if buf.len() as u64 + frame.len() as u64 > piece.size {
                        warn!("Node sent more bytes than declared");
                        return Err(NebulaError::Transport(
                            "node sent more bytes than declared".to_string(),
                        ));
                    }
                    buf.extend_from_slice(&frame);
                }
                Some(NodeMessage::Rejected { reason }) => {
                    return Err(NebulaError::RemoteRejected(reason))
                }
                Some(other) => return Err(unexpected("piece data", &other)),
                None => break,
            }
        }

        if (buf.len() as u64) < piece.size {
            return Err(NebulaError::ShortStream {
                expected: piece.size,
                actual: buf.len() as u64,
            });
        }
        debug!("Piece retrieved");
        Ok(buf.freeze())
    }

    /// Ask whether the node holds a piece
    #[instrument(skip(self, authz), fields(endpoint = %endpoint, key = %piece.key))]
    pub async fn inspect_piece(
        &self,
        endpoint: &str,
        piece: &PieceRef,
        authz: &PieceAuthorization,
    ) -> Result<PieceStatus> {
        let mut framed = self.connect(endpoint).await?;
        let request = ClientMessage::Inspect(InspectRequest {
            piece: *piece,
            authz: authz.clone(),
        });
        self.send(&mut framed, request).await?;

        match self.recv(&mut framed).await? {
            Some(NodeMessage::InspectResult { exists, size }) => Ok(PieceStatus { exists, size }),
            Some(NodeMessage::Rejected { reason }) => Err(NebulaError::RemoteRejected(reason)),
            Some(other) => Err(unexpected("inspect result", &other)),
            None => Err(NebulaError::Transport(
                "connection closed before inspect result".to_string(),
            )),
        }
    }

    /// Liveness check; the returned proof can be verified against the node key
    #[instrument(skip(self, nonce), fields(endpoint = %endpoint))]
    pub async fn ping(&self, endpoint: &str, nonce: &[u8]) -> Result<NodeProof> {
        let mut framed = self.connect(endpoint).await?;
        self.send(
            &mut framed,
            ClientMessage::Ping(PingRequest {
                nonce: nonce.to_vec(),
            }),
        )
        .await?;

        match self.recv(&mut framed).await? {
            Some(NodeMessage::Pong(proof)) => Ok(proof),
            Some(NodeMessage::Rejected { reason }) => Err(NebulaError::RemoteRejected(reason)),
            Some(other) => Err(unexpected("pong", &other)),
            None => Err(NebulaError::Transport(
                "connection closed before pong".to_string(),
            )),
        }
    }
}

fn unexpected(wanted: &str, got: &NodeMessage) -> NebulaError {
    let kind = match got {
        NodeMessage::StoreAck { .. } => "store ack",
        NodeMessage::Data(_) => "data",
        NodeMessage::InspectResult { .. } => "inspect result",
        NodeMessage::Pong(_) => "pong",
        NodeMessage::Rejected { .. } => "rejection",
    };
    NebulaError::Transport(format!("expected {}, node sent {}", wanted, kind))
}
