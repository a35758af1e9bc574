//! Nebula Network Layer
//!
//! Moves pieces between a client and storage nodes over the piece protocol:
//! - **`PieceClient`**: store, retrieve, inspect and ping, one TCP connection per call
//! - **`PieceServer`**: a storage node serving a [`PieceStore`], with ticket checks
//!
//! # Usage
//!
//! ```ignore
//! use nebula_network::{
//!     MemoryPieceStore, NodeIdentity, PieceClient, PieceServer, PieceServerConfig,
//! };
//! use std::sync::Arc;
//!
//! let server = PieceServer::bind(
//!     PieceServerConfig::new("127.0.0.1:0".parse()?),
//!     Arc::new(MemoryPieceStore::new()),
//!     NodeIdentity::new("node-1", node_key),
//! )
//! .await?;
//! let addr = server.local_addr()?;
//! tokio::spawn(server.run());
//!
//! let client = PieceClient::new();
//! client.store_piece(&addr.to_string(), &piece, &authz, &data[..], None).await?;
//! ```

pub mod client;
pub mod server;
pub mod store;

pub use client::{PieceClient, PieceClientConfig, PieceStatus, ProgressSink};
pub use server::{NodeIdentity, PieceServer, PieceServerConfig};
pub use store::{MemoryPieceStore, PieceStore};
