//! Serve Command
//!
//! Runs a storage node with an in-memory piece store until Ctrl+C.

use super::parse_node_key;
use anyhow::{Context, Result};
use nebula_network::{
    MemoryPieceStore, NodeIdentity, PieceServer, PieceServerConfig, PieceStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct ServeConfig {
    pub listen: SocketAddr,
    pub node_id: String,
    pub key: String,
    pub ticket_window: u64,
}

pub async fn run(config: ServeConfig) -> Result<()> {
    let key = parse_node_key(&config.key)?;
    let server_config = PieceServerConfig {
        ticket_window_secs: config.ticket_window,
        ..PieceServerConfig::new(config.listen)
    };

    let store = Arc::new(MemoryPieceStore::new());
    let server = PieceServer::bind(
        server_config,
        store.clone(),
        NodeIdentity::new(config.node_id.clone(), key),
    )
    .await
    .context("Failed to start piece server")?;

    info!(
        node_id = %config.node_id,
        addr = %server.local_addr()?,
        "Storage node started. Press Ctrl+C to stop."
    );

    let shutdown = CancellationToken::new();
    let mut serving = tokio::spawn(server.run_until(shutdown.clone()));

    tokio::select! {
        result = &mut serving => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Piece server failed"),
                Err(e) => error!(error = %e, "Piece server task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            shutdown.cancel();
            serving.await.context("Piece server task failed")??;
        }
    }

    info!(
        pieces = store.piece_count()?,
        bytes = store.bytes_used(),
        "Storage node stopped"
    );
    Ok(())
}
