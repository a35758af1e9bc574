//! CLI Commands

pub mod ping;
pub mod serve;
pub mod shard;

use anyhow::{Context, Result};
use nebula_core::NodeKey;

/// Parse a hex-encoded node key
pub fn parse_node_key(hex_key: &str) -> Result<NodeKey> {
    let bytes = hex::decode(hex_key.trim()).context("Node key must be hex encoded")?;
    if bytes.is_empty() {
        anyhow::bail!("Node key cannot be empty");
    }
    Ok(NodeKey::new(bytes))
}
