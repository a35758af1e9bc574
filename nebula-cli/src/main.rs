//! Nebula CLI
//!
//! # Commands
//! - `serve` - Run a storage node backed by memory
//! - `encode` - Erasure-code a file into shard files plus a JSON manifest
//! - `decode` - Rebuild a file from whatever shard files remain
//! - `verify` - Check shard files against their manifest
//! - `ping` - Check that a storage node is alive and prove its identity

use anyhow::Result;
use clap::{Parser, Subcommand};
use nebula_client::ClientConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod symbols;

use commands::{ping, serve, shard};

#[derive(Parser)]
#[command(name = "nebula")]
#[command(about = "Nebula data distribution tool")]
#[command(version)]
struct Cli {
    /// Client configuration file
    #[arg(short, long, global = true, default_value = "nebula.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage node serving the piece protocol
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:7600")]
        listen: SocketAddr,

        /// Node identifier reported in ping proofs
        #[arg(long, env = "NEBULA_NODE_ID")]
        node_id: String,

        /// Hex-encoded key shared with the tracker for ticket checks
        #[arg(long, env = "NEBULA_NODE_KEY", hide_env_values = true)]
        key: String,

        /// Accepted ticket clock skew, in seconds
        #[arg(long, default_value_t = nebula_core::DEFAULT_TICKET_WINDOW_SECS)]
        ticket_window: u64,
    },

    /// Split a file into data and parity shard files
    Encode {
        /// File to encode
        file: PathBuf,

        /// Number of data shards
        #[arg(short = 'k', long, default_value_t = 4)]
        data_shards: usize,

        /// Number of parity shards
        #[arg(short = 'm', long, default_value_t = 2)]
        parity_shards: usize,

        /// Directory for shard files and the manifest (defaults to the file's directory)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
    },

    /// Rebuild a file from its manifest and remaining shard files
    Decode {
        /// Manifest written by `encode`
        manifest: PathBuf,

        /// Output path (defaults to the original file name next to the manifest)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check shard files against their manifest without rebuilding
    Verify {
        /// Manifest written by `encode`
        manifest: PathBuf,
    },

    /// Ping a storage node
    Ping {
        /// Node endpoint (host:port)
        endpoint: String,

        /// Hex-encoded node key; when given, the identity proof is checked
        #[arg(long, env = "NEBULA_NODE_KEY", hide_env_values = true)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let config = ClientConfig::load_or_default(&cli.config).with_env_overrides();
    config.validate()?;

    match cli.command {
        Commands::Serve {
            listen,
            node_id,
            key,
            ticket_window,
        } => {
            serve::run(serve::ServeConfig {
                listen,
                node_id,
                key,
                ticket_window,
            })
            .await?;
        }

        Commands::Encode {
            file,
            data_shards,
            parity_shards,
            out_dir,
        } => {
            let policy = config.upload_policy();
            let manifest = shard::encode(
                &file,
                data_shards,
                parity_shards,
                policy.max_partition_size,
                out_dir.as_deref(),
            )
            .await?;
            println!(
                "{} Encoded {} ({} bytes) into {} shard files",
                symbols::CHECK,
                manifest.file_name,
                manifest.size,
                manifest.shard_count()
            );
        }

        Commands::Decode { manifest, output } => {
            let outcome = shard::decode(&manifest, output.as_deref()).await?;
            if outcome.repaired > 0 {
                println!(
                    "{} Rebuilt {} missing or corrupt shard(s)",
                    symbols::REPAIRED,
                    outcome.repaired
                );
            }
            println!(
                "{} Wrote {} ({} bytes)",
                symbols::CHECK,
                outcome.path.display(),
                outcome.size
            );
        }

        Commands::Verify { manifest } => {
            let outcome = shard::verify(&manifest).await?;
            if outcome.is_healthy() {
                println!(
                    "{} All shards of {} partition(s) intact",
                    symbols::CHECK,
                    outcome.partitions
                );
            } else {
                println!(
                    "{} {} missing, {} corrupt shard(s); parity mismatch in partitions {:?}",
                    symbols::WARN,
                    outcome.missing,
                    outcome.corrupt,
                    outcome.inconsistent
                );
                anyhow::bail!("Shard set for {} is degraded", manifest.display());
            }
        }

        Commands::Ping { endpoint, key } => {
            ping::run(&config, &endpoint, key.as_deref()).await?;
        }
    }

    Ok(())
}
