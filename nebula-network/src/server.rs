//! Reference storage node
//!
//! Serves the piece protocol over TCP from a [`PieceStore`]. Each connection
//! carries a single exchange. Tickets are checked against the node key, the
//! skew window and a replay guard before any bytes are read or served.

use crate::store::PieceStore;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use nebula_core::{
    unix_now, NebulaError, NodeKey, Operation, Result, TicketCodec, DEFAULT_TICKET_WINDOW_SECS,
    STREAM_FRAME_SIZE,
};
use nebula_protocol::{
    ClientMessage, InspectRequest, NodeCodec, NodeMessage, NodeProof, PieceAuthorization,
    PieceRef, RetrieveRequest, StoreHeader, DEFAULT_MAX_FRAME_LENGTH, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Configuration for a piece server
#[derive(Debug, Clone)]
pub struct PieceServerConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// Accepted ticket clock skew, in seconds
    pub ticket_window_secs: u64,
    /// Bound on every frame read and write
    pub io_timeout: Duration,
    /// Payload size of retrieve frames
    pub frame_size: usize,
    /// Maximum accepted frame length
    pub max_frame_length: usize,
}

impl Default for PieceServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7600)),
            ticket_window_secs: DEFAULT_TICKET_WINDOW_SECS,
            io_timeout: Duration::from_secs(30),
            frame_size: STREAM_FRAME_SIZE,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl PieceServerConfig {
    /// Create a new config with the specified address
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            listen_addr: addr,
            ..Default::default()
        }
    }
}

/// Who this node is: its id and the key it shares with the tracker
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub key: NodeKey,
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>, key: NodeKey) -> Self {
        Self {
            node_id: node_id.into(),
            key,
        }
    }
}

struct ServerState {
    config: PieceServerConfig,
    store: Arc<dyn PieceStore>,
    identity: NodeIdentity,
    // auth token -> unix second after which it can be forgotten
    seen_tokens: Mutex<HashMap<Vec<u8>, u64>>,
}

type NodeFramed = Framed<TcpStream, NodeCodec>;

// Larger pieces grow the buffer as frames arrive
const PREALLOC_LIMIT: u64 = 16 * 1024 * 1024;

/// Storage node listening for piece requests
pub struct PieceServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl PieceServer {
    /// Bind the listener; requests are served once [`run`](Self::run) is awaited
    pub async fn bind(
        config: PieceServerConfig,
        store: Arc<dyn PieceStore>,
        identity: NodeIdentity,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
            NebulaError::Transport(format!("failed to bind {}: {}", config.listen_addr, e))
        })?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                config,
                store,
                identity,
                seen_tokens: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn node_id(&self) -> &str {
        &self.state.identity.node_id
    }

    /// Serve until the listener fails
    pub async fn run(self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Serve until `shutdown` fires; the listener is closed on return
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            node_id = %self.state.identity.node_id,
            addr = %addr,
            protocol = PROTOCOL_VERSION,
            "Piece server listening"
        );

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream, peer).await {
                    debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }

        info!(addr = %addr, "Piece server stopped");
        Ok(())
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let codec = NodeCodec::with_max_frame_length(state.config.max_frame_length);
    let mut framed = Framed::new(stream, codec);

    let request = match recv(&state, &mut framed).await? {
        Some(message) => message,
        None => return Ok(()),
    };

    match request {
        ClientMessage::Store(header) => handle_store(&state, &mut framed, header).await,
        ClientMessage::Retrieve(request) => handle_retrieve(&state, &mut framed, request).await,
        ClientMessage::Inspect(request) => handle_inspect(&state, &mut framed, request).await,
        ClientMessage::Ping(ping) => {
            debug!(peer = %peer, "Ping");
            let proof = NodeProof::compute(
                state.identity.node_id.clone(),
                &state.identity.key,
                &ping.nonce,
            );
            send(&state, &mut framed, NodeMessage::Pong(proof)).await
        }
        ClientMessage::Data(_) => {
            reject(&state, &mut framed, "data frame without a store header".to_string()).await
        }
    }
}

#[instrument(
    skip_all,
    fields(
        node_id = %state.identity.node_id,
        key = %header.piece.key,
        size = header.piece.size
    )
)]
async fn handle_store(
    state: &ServerState,
    framed: &mut NodeFramed,
    header: StoreHeader,
) -> Result<()> {
    let piece = header.piece;
    if let Err(e) = authorize(state, Operation::Store, &piece, &header.authz) {
        warn!(error = %e, "Store rejected");
        return reject(state, framed, e.to_string()).await;
    }

    let mut buf = BytesMut::with_capacity(piece.size.min(PREALLOC_LIMIT) as usize);
    while (buf.len() as u64) < piece.size {
        match recv(state, framed).await? {
            Some(ClientMessage::Data(frame)) => {
                if buf.len() as u64 + frame.len() as u64 > piece.size {
                    let reason = "more data than declared".to_string();
                    return store_ack(state, framed, Some(reason)).await;
                }
                buf.extend_from_slice(&frame);
            }
            Some(other) => {
                let reason = format!("unexpected {} message during store", message_kind(&other));
                return store_ack(state, framed, Some(reason)).await;
            }
            None => {
                debug!(received = buf.len(), "Client closed before sending the whole piece");
                return Ok(());
            }
        }
    }

    let data = buf.freeze();
    if !piece.key.verify(&data) {
        warn!("Piece bytes do not match content key");
        return store_ack(state, framed, Some("content hash mismatch".to_string())).await;
    }

    match state.store.put(piece.key, data) {
        Ok(()) => {
            metrics::counter!("nebula_node_pieces_stored_total").increment(1);
            info!("Piece stored");
            store_ack(state, framed, None).await
        }
        Err(e) => store_ack(state, framed, Some(e.to_string())).await,
    }
}

#[instrument(skip_all, fields(node_id = %state.identity.node_id, key = %request.piece.key))]
async fn handle_retrieve(
    state: &ServerState,
    framed: &mut NodeFramed,
    request: RetrieveRequest,
) -> Result<()> {
    let piece = request.piece;
    if let Err(e) = authorize(state, Operation::Retrieve, &piece, &request.authz) {
        warn!(error = %e, "Retrieve rejected");
        return reject(state, framed, e.to_string()).await;
    }

    let data = match state.store.get(&piece.key)? {
        Some(data) => data,
        None => return reject(state, framed, "piece not found".to_string()).await,
    };
    if data.len() as u64 != piece.size {
        return reject(
            state,
            framed,
            format!("stored size {} differs from requested {}", data.len(), piece.size),
        )
        .await;
    }

    let frame_size = state.config.frame_size.max(1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + frame_size).min(data.len());
        send(state, framed, NodeMessage::Data(data.slice(offset..end))).await?;
        offset = end;
    }
    send(state, framed, NodeMessage::Data(Bytes::new())).await?;

    metrics::counter!("nebula_node_pieces_served_total").increment(1);
    debug!(size = data.len(), "Piece served");
    Ok(())
}

async fn handle_inspect(
    state: &ServerState,
    framed: &mut NodeFramed,
    request: InspectRequest,
) -> Result<()> {
    let piece = request.piece;
    if let Err(e) = authorize(state, Operation::Inspect, &piece, &request.authz) {
        return reject(state, framed, e.to_string()).await;
    }
    let size = state.store.size_of(&piece.key)?;
    send(
        state,
        framed,
        NodeMessage::InspectResult {
            exists: size.is_some(),
            size: size.unwrap_or(0),
        },
    )
    .await
}

/// Ticket MAC, skew window, then single use within the window
fn authorize(
    state: &ServerState,
    operation: Operation,
    piece: &PieceRef,
    authz: &PieceAuthorization,
) -> Result<()> {
    let now = unix_now();
    let window = state.config.ticket_window_secs;
    TicketCodec::validate_at(
        &authz.scope(operation, piece),
        &authz.ticket,
        &authz.auth,
        &state.identity.key,
        now,
        window,
    )?;

    let mut seen = state.seen_tokens.lock();
    seen.retain(|_, forget_after| *forget_after >= now);
    if seen.contains_key(authz.auth.as_bytes()) {
        return Err(NebulaError::Unauthorized(format!(
            "ticket {} already used",
            authz.ticket
        )));
    }
    seen.insert(authz.auth.as_bytes().to_vec(), authz.timestamp.saturating_add(window));
    Ok(())
}

fn message_kind(message: &ClientMessage) -> &'static str {
    match message {
        ClientMessage::Store(_) => "store",
        ClientMessage::Data(_) => "data",
        ClientMessage::Retrieve(_) => "retrieve",
        ClientMessage::Inspect(_) => "inspect",
        ClientMessage::Ping(_) => "ping",
    }
}

async fn recv(state: &ServerState, framed: &mut NodeFramed) -> Result<Option<ClientMessage>> {
    match tokio::time::timeout(state.config.io_timeout, framed.next()).await {
        Ok(Some(message)) => Ok(Some(message?)),
        Ok(None) => Ok(None),
        Err(_) => Err(NebulaError::Transport("timed out waiting for client".to_string())),
    }
}

async fn send(state: &ServerState, framed: &mut NodeFramed, message: NodeMessage) -> Result<()> {
    match tokio::time::timeout(state.config.io_timeout, framed.send(message)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(NebulaError::Transport("timed out writing to client".to_string())),
    }
}

async fn reject(state: &ServerState, framed: &mut NodeFramed, reason: String) -> Result<()> {
    send(state, framed, NodeMessage::Rejected { reason }).await
}

async fn store_ack(
    state: &ServerState,
    framed: &mut NodeFramed,
    error: Option<String>,
) -> Result<()> {
    send(
        state,
        framed,
        NodeMessage::StoreAck {
            success: error.is_none(),
            error,
        },
    )
    .await
}
