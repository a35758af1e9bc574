//! Piece protocol messages

use bytes::Bytes;
use nebula_core::{AuthToken, ContentHash, NodeKey, Operation, TicketScope};
use serde::{Deserialize, Serialize};

/// The piece a request is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceRef {
    /// Content key the node files the piece under
    pub key: ContentHash,
    /// Declared piece size in bytes
    pub size: u64,
}

impl PieceRef {
    pub fn new(key: ContentHash, size: u64) -> Self {
        Self { key, size }
    }
}

/// Tracker-issued ticket and its MAC, carried once per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceAuthorization {
    pub ticket: String,
    pub auth: AuthToken,
    /// Issue time, Unix seconds
    pub timestamp: u64,
}

impl PieceAuthorization {
    pub fn new(ticket: impl Into<String>, auth: AuthToken, timestamp: u64) -> Self {
        Self {
            ticket: ticket.into(),
            auth,
            timestamp,
        }
    }

    /// Scope the MAC must cover for `operation` on `piece`
    pub fn scope(&self, operation: Operation, piece: &PieceRef) -> TicketScope {
        TicketScope::new(operation, piece.key, piece.size, self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub piece: PieceRef,
    pub authz: PieceAuthorization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub piece: PieceRef,
    pub authz: PieceAuthorization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectRequest {
    pub piece: PieceRef,
    pub authz: PieceAuthorization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub nonce: Vec<u8>,
}

/// Node identity proof returned by `Ping`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProof {
    pub node_id: String,
    /// blake3(node key || nonce)
    pub proof: ContentHash,
}

impl NodeProof {
    pub fn compute(node_id: impl Into<String>, key: &NodeKey, nonce: &[u8]) -> Self {
        Self {
            node_id: node_id.into(),
            proof: Self::digest(key, nonce),
        }
    }

    /// Check the proof against key material known for this node
    pub fn verify(&self, key: &NodeKey, nonce: &[u8]) -> bool {
        self.proof == Self::digest(key, nonce)
    }

    fn digest(key: &NodeKey, nonce: &[u8]) -> ContentHash {
        let mut buf = Vec::with_capacity(key.as_bytes().len() + nonce.len());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(nonce);
        ContentHash::compute(&buf)
    }
}

/// Messages sent by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Store(StoreHeader),
    /// Piece payload following a `Store` header
    Data(Bytes),
    Retrieve(RetrieveRequest),
    Inspect(InspectRequest),
    Ping(PingRequest),
}

/// Messages sent by a storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMessage {
    StoreAck {
        success: bool,
        error: Option<String>,
    },
    /// Piece payload; an empty frame ends a retrieve stream
    Data(Bytes),
    InspectResult {
        exists: bool,
        size: u64,
    },
    Pong(NodeProof),
    Rejected {
        reason: String,
    },
}
