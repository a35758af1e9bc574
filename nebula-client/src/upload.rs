//! Upload orchestration
//!
//! `SIZE-CHECK -> (REPLICA | PARTITION -> ENCODE -> PLACE -> TRANSPORT) -> COMMIT`.
//! Nothing is retried: the first failed partition aborts the upload and the
//! tracker never sees a manifest for it.

use crate::config::ClientConfig;
use crate::events::{emit, EventObserver, TransferEvent};
use crate::metrics;
use crate::progress::{FileProgress, ProgressTracker};
use crate::tracker::{
    CheckOutcome, FileInfo, MetadataService, NodeAssignment, PartitionPlacement,
    PlacementManifest, ShardPlacement, ShardSummary,
};
use crate::{until_cancelled, within, DEFAULT_OPERATION_TIMEOUT};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use nebula_core::{
    plan_partitions, slice_ranges, ContentHash, ContentHasher, ErasureConfig, ErasureEncoder,
    NebulaError, Partition, ReplicaSet, Result, StorageMode, UploadPolicy, DEFAULT_SLICE_SIZE,
};
use nebula_network::{PieceClient, ProgressSink};
use nebula_protocol::PieceRef;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default number of shard transfers in flight per partition
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 8;

/// What an upload ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    AlreadyStored,
    StoredInline,
    Replicated { copies: usize },
    ErasureCoded { partitions: usize, shards: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub key: ContentHash,
    pub size: u64,
    pub outcome: UploadOutcome,
}

/// Drives a file from disk onto storage nodes
pub struct Uploader {
    tracker: Arc<dyn MetadataService>,
    client: PieceClient,
    max_concurrent: usize,
    operation_timeout: Duration,
    progress: ProgressTracker,
    observer: Option<EventObserver>,
}

impl Uploader {
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

    /// Bound on each piece store, start to acknowledgement
    pub fn with_operation_timeout(mut self, limit: Duration) -> Self {
        self.operation_timeout = limit;
        self
    }

    /// Share a progress map with other transfers or a status poller
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

    /// Upload one file.
    ///
    /// The file is durable only once this returns `Ok`. On any error,
    /// including cancellation, nothing is committed; pieces already sent to
    /// nodes are left for the tracker to garbage-collect.
    #[instrument(skip(self, policy, cancel), fields(path = %path.display()))]
    pub async fn upload_file(
        &self,
        path: &Path,
        policy: &UploadPolicy,
        cancel: &CancellationToken,
    ) -> Result<UploadReport> {
        policy.validate()?;
        if cancel.is_cancelled() {
            return Err(NebulaError::Cancelled);
        }

        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(NebulaError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let size = metadata.len();
        let modified: DateTime<Utc> = metadata.modified()?.into();
        let mut file = File::open(path).await?;

        let (key, inline_data) = match policy.mode_for(size) {
            StorageMode::Replica => {
                let data = read_all(&mut file, size).await?;
                (ContentHash::compute(&data), Some(data))
            }
            StorageMode::Erasure => (hash_file(&mut file, size, cancel).await?, None),
        };
        debug!(key = %key, size, "File hashed");

        let info = FileInfo {
            key,
            size,
            modified,
            inline_data,
        };
        let outcome = self.tracker.check_existing(&info).await?;
        if cancel.is_cancelled() {
            return Err(NebulaError::Cancelled);
        }

        let progress_key = path.display().to_string();
        let (manifest, outcome, handle) = match outcome {
            CheckOutcome::AlreadyStored => {
                info!(key = %key, "File already stored");
                return Ok(UploadReport {
                    key,
                    size,
                    outcome: UploadOutcome::AlreadyStored,
                });
            }
            CheckOutcome::StoredInline => {
                info!(key = %key, "File stored inline by tracker");
                return Ok(UploadReport {
                    key,
                    size,
                    outcome: UploadOutcome::StoredInline,
                });
            }
            CheckOutcome::Replicate { assignments } => {
                let data = match info.inline_data {
                    Some(data) => data,
                    None => {
                        file.seek(SeekFrom::Start(0)).await?;
                        read_all(&mut file, size).await?
                    }
                };
                let copies = assignments.len();
                let handle = self.progress.start(progress_key.clone(), size * copies as u64);
                let result = self.replicate(key, data, assignments, &handle, cancel).await;
                (
                    self.settle(result, &progress_key)?,
                    UploadOutcome::Replicated { copies },
                    handle,
                )
            }
            CheckOutcome::Erasure {
                data_shards,
                parity_shards,
            } => {
                let config = ErasureConfig::new(data_shards, parity_shards)?;
                let partitions = plan_partitions(size, policy.max_partition_size)?;
                let total: u64 = partitions
                    .iter()
                    .map(|p| config.shard_size(p.len) as u64 * config.total_shards() as u64)
                    .sum();
                let handle = self.progress.start(progress_key.clone(), total);
                let result = self
                    .erasure_code(key, size, &mut file, config, &partitions, &handle, cancel)
                    .await;
                (
                    self.settle(result, &progress_key)?,
                    UploadOutcome::ErasureCoded {
                        partitions: partitions.len(),
                        shards: config.total_shards() * partitions.len(),
                    },
                    handle,
                )
            }
        };

        if cancel.is_cancelled() {
            self.progress.remove(&progress_key);
            return Err(NebulaError::Cancelled);
        }
        if let Err(e) = self.tracker.commit_placement(&key, &manifest).await {
            self.progress.remove(&progress_key);
            return Err(e);
        }

        self.progress.complete(&progress_key, &handle);
        info!(key = %key, size, ?outcome, "Upload committed");
        Ok(UploadReport { key, size, outcome })
    }

    fn settle(
        &self,
        result: Result<PlacementManifest>,
        progress_key: &str,
    ) -> Result<PlacementManifest> {
        if result.is_err() {
            self.progress.remove(progress_key);
        }
        result
    }

    /// One full copy per assignment; every copy must be acknowledged.
    async fn replicate(
        &self,
        key: ContentHash,
        data: Bytes,
        assignments: Vec<NodeAssignment>,
        progress: &FileProgress,
        cancel: &CancellationToken,
    ) -> Result<PlacementManifest> {
        if assignments.is_empty() {
            return Err(NebulaError::Metadata(
                "tracker returned no replica assignments".to_string(),
            ));
        }
        let size = data.len() as u64;
        let replicas = ReplicaSet::new(data, assignments.len())?;
        let piece = PieceRef::new(replicas.hash(), size);
        if piece.key != key {
            return Err(NebulaError::HashVerificationFailed);
        }

        let transfers = assignments.iter().zip(replicas.iter()).map(|(assignment, copy)| {
            let sink = progress.piece_sink();
            async move {
                let authorization = assignment.authorization();
                let store = self.client.store_piece(
                    &assignment.endpoint,
                    &piece,
                    &authorization,
                    copy.as_ref(),
                    Some(&sink as &dyn ProgressSink),
                );
                let result = within(self.operation_timeout, &assignment.endpoint, store).await;
                (assignment, result)
            }
        });
        let results: Vec<_> = until_cancelled(
            cancel,
            stream::iter(transfers)
                .buffer_unordered(self.max_concurrent)
                .collect::<Vec<_>>(),
        )
        .await?;

        // Results are in completion order
        let mut primary = None;
        let mut last_error = None;
        for (assignment, result) in results {
            match result {
                Ok(()) => {
                    metrics::record_shard_uploaded(size);
                    primary.get_or_insert_with(|| assignment.node_id.clone());
                }
                Err(e) if e.is_shard_local() => {
                    warn!(node = %assignment.node_id, error = %e, "Replica copy failed");
                    emit(
                        &self.observer,
                        TransferEvent::ShardFailed {
                            partition: 0,
                            shard: 0,
                            node_id: assignment.node_id.clone(),
                            error: e.to_string(),
                        },
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = last_error {
            return Err(e);
        }
        let primary_node =
            primary.ok_or_else(|| NebulaError::Internal("no replica stored".to_string()))?;

        Ok(PlacementManifest {
            mode: StorageMode::Replica,
            data_shards: 1,
            parity_shards: 0,
            partitions: vec![PartitionPlacement {
                index: 0,
                size,
                shards: vec![ShardPlacement {
                    index: 0,
                    hash: key,
                    size,
                    is_data: true,
                    node_ids: assignments.iter().map(|a| a.node_id.clone()).collect(),
                    primary_node,
                }],
            }],
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn erasure_code(
        &self,
        key: ContentHash,
        size: u64,
        file: &mut File,
        config: ErasureConfig,
        partitions: &[Partition],
        progress: &FileProgress,
        cancel: &CancellationToken,
    ) -> Result<PlacementManifest> {
        let encoder = Arc::new(ErasureEncoder::with_config(config)?);
        let total = partitions.len() as u32;
        let mut placed = Vec::with_capacity(partitions.len());

        for partition in partitions {
            if cancel.is_cancelled() {
                return Err(NebulaError::Cancelled);
            }
            let placement = self
                .place_partition(key, size, file, &encoder, partition, progress, cancel)
                .await?;
            placed.push(placement);
            debug!(partition = partition.index, total, "Partition placed");
            emit(
                &self.observer,
                TransferEvent::PartitionCompleted {
                    index: partition.index,
                    total,
                },
            );
        }

        Ok(PlacementManifest {
            mode: StorageMode::Erasure,
            data_shards: config.data_shards,
            parity_shards: config.parity_shards,
            partitions: placed,
        })
    }

    /// ENCODE -> PLACE -> TRANSPORT for one partition
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(partition = partition.index, len = partition.len))]
    async fn place_partition(
        &self,
        key: ContentHash,
        size: u64,
        file: &mut File,
        encoder: &Arc<ErasureEncoder>,
        partition: &Partition,
        progress: &FileProgress,
        cancel: &CancellationToken,
    ) -> Result<PartitionPlacement> {
        file.seek(SeekFrom::Start(partition.offset)).await?;
        let mut buf = vec![0u8; partition.len as usize];
        file.read_exact(&mut buf).await?;

        let worker = Arc::clone(encoder);
        let shards = tokio::task::spawn_blocking(move || worker.encode_parallel(&buf))
            .await
            .map_err(|e| NebulaError::Internal(format!("encode task failed: {}", e)))??;

        let summaries: Vec<ShardSummary> = shards
            .iter()
            .map(|shard| ShardSummary {
                index: shard.index,
                hash: shard.hash(),
                size: shard.size() as u64,
                is_data: !shard.is_parity,
            })
            .collect();

        let assignments = self
            .tracker
            .prepare_partition(&key, size, partition.index, &summaries)
            .await?;
        if assignments.len() != shards.len() {
            return Err(NebulaError::Metadata(format!(
                "tracker returned {} assignments for {} shards",
                assignments.len(),
                shards.len()
            )));
        }

        let transfers = shards
            .iter()
            .zip(&summaries)
            .zip(&assignments)
            .map(|((shard, summary), assignment)| {
                let piece = PieceRef::new(summary.hash, summary.size);
                let sink = progress.piece_sink();
                async move {
                    let authorization = assignment.authorization();
                    let store = self.client.store_piece(
                        &assignment.endpoint,
                        &piece,
                        &authorization,
                        shard.data.as_ref(),
                        Some(&sink as &dyn ProgressSink),
                    );
                    let result =
                        within(self.operation_timeout, &assignment.endpoint, store).await;
                    (summary, assignment, result)
                }
            });
        let results: Vec<_> = until_cancelled(
            cancel,
            stream::iter(transfers)
                .buffer_unordered(self.max_concurrent)
                .collect::<Vec<_>>(),
        )
        .await?;

        let mut placed = Vec::with_capacity(results.len());
        let mut last_error = None;
        for (summary, assignment, result) in results {
            match result {
                Ok(()) => {
                    metrics::record_shard_uploaded(summary.size);
                    placed.push(ShardPlacement {
                        index: summary.index,
                        hash: summary.hash,
                        size: summary.size,
                        is_data: summary.is_data,
                        node_ids: vec![assignment.node_id.clone()],
                        primary_node: assignment.node_id.clone(),
                    });
                }
                Err(e) if e.is_shard_local() => {
                    warn!(
                        shard = summary.index,
                        node = %assignment.node_id,
                        error = %e,
                        "Shard upload failed"
                    );
                    emit(
                        &self.observer,
                        TransferEvent::ShardFailed {
                            partition: partition.index,
                            shard: summary.index,
                            node_id: assignment.node_id.clone(),
                            error: e.to_string(),
                        },
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = last_error {
            return Err(e);
        }
        placed.sort_by_key(|shard| shard.index);

        Ok(PartitionPlacement {
            index: partition.index,
            size: partition.len,
            shards: placed,
        })
    }
}

async fn read_all(file: &mut File, size: u64) -> Result<Bytes> {
    let mut data = Vec::with_capacity(size as usize);
    file.read_to_end(&mut data).await?;
    if data.len() as u64 != size {
        return Err(NebulaError::ShortStream {
            expected: size,
            actual: data.len() as u64,
        });
    }
    Ok(Bytes::from(data))
}

/// Hash in bounded slices so large files never sit in memory whole
async fn hash_file(file: &mut File, size: u64, cancel: &CancellationToken) -> Result<ContentHash> {
    let mut hasher = ContentHasher::new();
    let mut buf = Vec::new();
    for range in slice_ranges(size, DEFAULT_SLICE_SIZE)? {
        if cancel.is_cancelled() {
            return Err(NebulaError::Cancelled);
        }
        buf.resize(range.len() as usize, 0);
        file.read_exact(&mut buf).await?;
        hasher.update(&buf);
    }
    Ok(hasher.finalize())
}
