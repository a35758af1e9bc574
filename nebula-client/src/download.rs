//! Download orchestration
//!
//! Output goes to `<dest>.partial` and is renamed into place only after
//! every partition has been rebuilt and written; any error or cancellation
//! removes the partial file.

use crate::config::ClientConfig;
use crate::events::{emit, EventObserver, TransferEvent};
use crate::metrics;
use crate::progress::{FileProgress, ProgressTracker};
use crate::tracker::{
    MetadataService, ResolvedFile, ResolvedPartition, ResolvedShard, ShardLocation,
};
use crate::upload::DEFAULT_MAX_CONCURRENT_TRANSFERS;
use crate::{until_cancelled, within, DEFAULT_OPERATION_TIMEOUT};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use nebula_core::{
    recover_replica, ContentHash, ErasureConfig, ErasureEncoder, NebulaError, Result, ShardData,
};
use nebula_network::PieceClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How the file was recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    Inline,
    Replica,
    Erasure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub key: ContentHash,
    pub size: u64,
    pub mode: DownloadMode,
    pub partitions: usize,
    /// Shards that were missing or corrupt and had to be rebuilt
    pub shards_repaired: usize,
}

/// `<dest>.partial`, deleted on drop unless committed
struct PartialFile {
    path: PathBuf,
    dest: PathBuf,
    file: Option<File>,
    written: u64,
}

impl PartialFile {
    async fn create(dest: &Path) -> Result<Self> {
        let mut name = dest.as_os_str().to_owned();
        name.push(".partial");
        let path = PathBuf::from(name);
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            dest: dest.to_path_buf(),
            file: Some(file),
            written: 0,
        })
    }

    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| NebulaError::Internal("partial file already closed".to_string()))?;
        file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&self.path, &self.dest).await?;
        // Renamed away; nothing left for drop to clean up
        self.path = PathBuf::new();
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.path.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Fetches pieces and rebuilds files
pub struct Downloader {
    tracker: Arc<dyn MetadataService>,
    client: PieceClient,
    max_concurrent: usize,
    operation_timeout: Duration,
    progress: ProgressTracker,
    observer: Option<EventObserver>,
}

impl Downloader {
    pub fn new(tracker: Arc<dyn MetadataService>, client: PieceClient) -> Self {
        Self {
            tracker,
            client,
            max_concurrent: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            progress: ProgressTracker::new(),
            observer: None,
        }
    }

    pub fn from_config(tracker: Arc<dyn MetadataService>, config: &ClientConfig) -> Self {
        Self::new(tracker, PieceClient::with_config(config.piece_client_config()))
            .with_concurrency(config.transfer.max_concurrent_transfers)
            .with_operation_timeout(config.operation_timeout())
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Bound on each piece retrieve, request to last byte
    pub fn with_operation_timeout(mut self, limit: Duration) -> Self {
        self.operation_timeout = limit;
        self
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_observer(mut self, observer: EventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Download the file `key` of `size` bytes to `dest`.
    ///
    /// `InsufficientShards` means some partition no longer has `k` usable
    /// shards; it is the only error that retrying cannot fix.
    #[instrument(skip(self, cancel), fields(key = %key, dest = %dest.display()))]
    pub async fn download_file(
        &self,
        key: &ContentHash,
        size: u64,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport> {
        if cancel.is_cancelled() {
            return Err(NebulaError::Cancelled);
        }
        let resolved = self.tracker.resolve_placement(key, size).await?;

        let mut partial = PartialFile::create(dest).await?;
        let progress_key = dest.display().to_string();
        let handle = self.progress.start(progress_key.clone(), size);

        let result = match resolved {
            ResolvedFile::Inline(data) => {
                if !key.verify(&data) {
                    Err(NebulaError::HashVerificationFailed)
                } else {
                    partial.append(&data).await.map(|_| (DownloadMode::Inline, 0, 0))
                }
            }
            ResolvedFile::Partitions(partitions)
                if partitions.len() == 1 && partitions[0].shards.len() == 1 =>
            {
                self.fetch_replica(&partitions[0].shards[0], &mut partial, cancel)
                    .await
                    .map(|_| (DownloadMode::Replica, 1, 0))
            }
            ResolvedFile::Partitions(partitions) => self
                .fetch_erasure(&partitions, &mut partial, &handle, cancel)
                .await
                .map(|repaired| (DownloadMode::Erasure, partitions.len(), repaired)),
        };

        let result = match result {
            Ok(_) if partial.written != size => Err(NebulaError::ShortStream {
                expected: size,
                actual: partial.written,
            }),
            Ok(done) => partial.commit().await.map(|_| done),
            Err(e) => Err(e),
        };

        match result {
            Ok((mode, partitions, shards_repaired)) => {
                self.progress.complete(&progress_key, &handle);
                metrics::record_download(size);
                info!(?mode, partitions, shards_repaired, "Download complete");
                Ok(DownloadReport {
                    key: *key,
                    size,
                    mode,
                    partitions,
                    shards_repaired,
                })
            }
            Err(e) => {
                self.progress.remove(&progress_key);
                Err(e)
            }
        }
    }

    /// Locations are tried in listed order; the first intact copy wins
    async fn fetch_replica(
        &self,
        shard: &ResolvedShard,
        partial: &mut PartialFile,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for location in &shard.locations {
            let copy = until_cancelled(cancel, self.retrieve(0, shard, location)).await??;
            let Some(copy) = copy else { continue };

            match recover_replica([Some(copy)], &shard.hash) {
                Ok(data) => {
                    partial.append(&data).await?;
                    emit(
                        &self.observer,
                        TransferEvent::PartitionCompleted { index: 0, total: 1 },
                    );
                    return Ok(());
                }
                Err(_) => {
                    let mismatch = NebulaError::HashVerificationFailed;
                    self.report_failure(0, shard, location, &mismatch);
                }
            }
        }
        Err(NebulaError::NoValidReplica)
    }

    async fn fetch_erasure(
        &self,
        partitions: &[ResolvedPartition],
        partial: &mut PartialFile,
        progress: &FileProgress,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut ordered: Vec<&ResolvedPartition> = partitions.iter().collect();
        ordered.sort_by_key(|p| p.index);
        let total = ordered.len() as u32;

        let mut repaired = 0;
        for partition in ordered {
            if cancel.is_cancelled() {
                return Err(NebulaError::Cancelled);
            }
            let (data, rebuilt) = self.rebuild_partition(partition, cancel).await?;
            partial.append(&data).await?;
            progress.advance(data.len() as u64);
            repaired += rebuilt;

            debug!(partition = partition.index, rebuilt, "Partition written");
            emit(
                &self.observer,
                TransferEvent::PartitionCompleted {
                    index: partition.index,
                    total,
                },
            );
        }
        Ok(repaired)
    }

    /// Fetch every shard, then verify, reconstruct and join on the blocking pool
    #[instrument(skip_all, fields(partition = partition.index, size = partition.size))]
    async fn rebuild_partition(
        &self,
        partition: &ResolvedPartition,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, usize)> {
        let mut shards: Vec<&ResolvedShard> = partition.shards.iter().collect();
        shards.sort_by_key(|s| s.index);
        if shards.iter().enumerate().any(|(i, s)| s.index as usize != i) {
            return Err(NebulaError::Metadata(format!(
                "partition {} has non-contiguous shard indices",
                partition.index
            )));
        }
        let data_shards = shards.iter().filter(|s| s.is_data).count();
        if shards.iter().any(|s| s.is_data != ((s.index as usize) < data_shards)) {
            return Err(NebulaError::Metadata(format!(
                "partition {} lists data shards outside the first {} positions",
                partition.index, data_shards
            )));
        }
        let config = ErasureConfig::new(data_shards, shards.len() - data_shards)?;

        let fetches = shards.iter().map(|shard| async move {
            self.fetch_shard(partition.index, shard)
                .await
                .map(|data| (shard.index as usize, data))
        });
        let results = until_cancelled(
            cancel,
            stream::iter(fetches)
                .buffer_unordered(self.max_concurrent)
                .collect::<Vec<_>>(),
        )
        .await?;

        let mut slots: Vec<Option<ShardData>> = vec![None; shards.len()];
        for result in results {
            if let (index, Some(data)) = result? {
                slots[index] = Some(ShardData::new(index as u32, data, index >= data_shards));
            }
        }
        let hashes: Vec<ContentHash> = shards.iter().map(|s| s.hash).collect();
        let len = partition.size;

        tokio::task::spawn_blocking(move || -> Result<(Bytes, usize)> {
            let encoder = ErasureEncoder::with_config(config)?;
            let report = encoder.verify_shards(&mut slots, &hashes)?;
            let absent = report.corrupt.len() + report.missing.len();
            encoder.reconstruct(&mut slots)?;
            Ok((encoder.join(&slots, len)?, absent))
        })
        .await
        .map_err(|e| NebulaError::Internal(format!("decode task failed: {}", e)))?
    }

    /// Try each location in order; `None` when none yields the right bytes
    async fn fetch_shard(&self, partition: u32, shard: &ResolvedShard) -> Result<Option<Bytes>> {
        for location in &shard.locations {
            if let Some(data) = self.retrieve(partition, shard, location).await? {
                if shard.hash.verify(&data) {
                    return Ok(Some(data));
                }
                let mismatch = NebulaError::HashVerificationFailed;
                self.report_failure(partition, shard, location, &mismatch);
            }
        }
        Ok(None)
    }

    /// One bounded retrieve. Shard-local failures are reported and become
    /// `None`; anything else aborts the download.
    async fn retrieve(
        &self,
        partition: u32,
        shard: &ResolvedShard,
        location: &ShardLocation,
    ) -> Result<Option<Bytes>> {
        let piece = shard.piece();
        let fetch = self
            .client
            .retrieve_piece(&location.endpoint, &piece, &location.authz);
        match within(self.operation_timeout, &location.endpoint, fetch).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_shard_local() => {
                self.report_failure(partition, shard, location, &e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn report_failure(
        &self,
        partition: u32,
        shard: &ResolvedShard,
        location: &ShardLocation,
        error: &NebulaError,
    ) {
        warn!(
            partition,
            shard = shard.index,
            node = %location.node_id,
            error = %error,
            "Shard fetch failed"
        );
        metrics::record_fetch_failed();
        emit(
            &self.observer,
            TransferEvent::ShardFailed {
                partition,
                shard: shard.index,
                node_id: location.node_id.clone(),
                error: error.to_string(),
            },
        );
    }
}
