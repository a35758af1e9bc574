//! Nebula Client
//!
//! Orchestrates whole-file transfers on top of the piece transport:
//! - **`Uploader`**: hash, choose replication or erasure coding, place and commit
//! - **`Downloader`**: resolve, fetch, verify, reconstruct and write atomically
//! - **`MetadataService`**: the tracker interface both sides consume
//! - **`ProgressTracker`**: per-file byte counters readable while transfers run
//!
//! # Usage
//!
//! ```ignore
//! use nebula_client::{ClientConfig, Downloader, Uploader};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ClientConfig::load_or_default("nebula.toml").with_env_overrides();
//! let uploader = Uploader::from_config(tracker.clone(), &config);
//! let report = uploader
//!     .upload_file(path, &config.upload_policy(), &CancellationToken::new())
//!     .await?;
//!
//! let downloader = Downloader::from_config(tracker, &config);
//! downloader
//!     .download_file(&report.key, report.size, dest, &CancellationToken::new())
//!     .await?;
//! ```

pub mod config;
pub mod download;
pub mod events;
pub mod metrics;
pub mod progress;
pub mod tracker;
pub mod upload;

pub use config::{ClientConfig, ConfigError};
pub use download::{DownloadMode, DownloadReport, Downloader};
pub use events::{EventObserver, TransferEvent};
pub use progress::{FileProgress, ProgressTracker};
pub use tracker::{
    CheckOutcome, FileInfo, MetadataService, NodeAssignment, PartitionPlacement,
    PlacementManifest, ResolvedFile, ResolvedPartition, ResolvedShard, ShardLocation,
    ShardPlacement, ShardSummary,
};
pub use upload::{UploadOutcome, UploadReport, Uploader};

use nebula_core::{NebulaError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default bound on one whole piece transfer
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Run `fut` unless `cancel` fires first; dropping `fut` closes its streams.
pub(crate) async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NebulaError::Cancelled),
        output = fut => Ok(output),
    }
}

/// Bound a whole piece transfer; expiry counts as a timeout on `peer`
pub(crate) async fn within<T, F>(limit: Duration, peer: &str, transfer: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, transfer).await {
        Ok(result) => result,
        Err(_) => Err(NebulaError::ConnectionTimeout {
            peer: peer.to_string(),
        }),
    }
}
