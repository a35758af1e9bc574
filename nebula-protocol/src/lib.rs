//! Nebula storage-node protocol
//!
//! Clients talk to storage nodes over plain TCP. Every message is a bincode
//! payload behind a 4-byte big-endian length prefix.
//!
//! # Exchanges
//! - `Store`: header with ticket, then `Data` frames, node answers `StoreAck`
//! - `Retrieve`: request with ticket, node streams `Data` frames ending with an empty one
//! - `Inspect`: request with ticket, node answers `InspectResult`
//! - `Ping`: nonce, node answers `Pong` with a proof over its key
//!
//! Any request can instead be answered with `Rejected`.

pub mod codec;
pub mod messages;

pub use codec::{ClientCodec, MessageCodec, NodeCodec, ProtocolError, DEFAULT_MAX_FRAME_LENGTH};
pub use messages::{
    ClientMessage, InspectRequest, NodeMessage, NodeProof, PieceAuthorization, PieceRef,
    PingRequest, RetrieveRequest, StoreHeader,
};

/// Protocol identifier, logged by nodes on startup
pub const PROTOCOL_VERSION: &str = "/nebula/piece/1.0.0";
