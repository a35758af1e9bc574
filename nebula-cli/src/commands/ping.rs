//! Ping Command

use super::parse_node_key;
use anyhow::{Context, Result};
use nebula_client::ClientConfig;
use nebula_network::PieceClient;
use std::time::Instant;

use crate::symbols;

pub async fn run(config: &ClientConfig, endpoint: &str, key: Option<&str>) -> Result<()> {
    let client = PieceClient::with_config(config.piece_client_config());
    let nonce: [u8; 16] = rand::random();

    let started = Instant::now();
    let proof = client
        .ping(endpoint, &nonce)
        .await
        .with_context(|| format!("Failed to ping {}", endpoint))?;
    let elapsed = started.elapsed();

    println!(
        "{} {} answered as {} in {} ms",
        symbols::CHECK,
        endpoint,
        proof.node_id,
        elapsed.as_millis()
    );

    if let Some(key) = key {
        let key = parse_node_key(key)?;
        if !proof.verify(&key, &nonce) {
            anyhow::bail!("Identity proof from {} does not match the given key", endpoint);
        }
        println!("{} Identity proof verified", symbols::CHECK);
    }
    Ok(())
}
