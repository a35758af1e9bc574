//! Metadata service interface
//!
//! The tracker decides where pieces go and mints the tickets that let the
//! client talk to storage nodes. This crate only consumes it; the concrete
//! service (RPC, HTTP, in-process) is supplied by the embedding application.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use nebula_core::{AuthToken, ContentHash, Result, StorageMode};
use nebula_protocol::{PieceAuthorization, PieceRef};
use serde::{Deserialize, Serialize};

/// What the client knows about a file before uploading it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub key: ContentHash,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Full file bytes, attached for replica-size files so the tracker may
    /// keep them inline
    pub inline_data: Option<Bytes>,
}

/// Tracker verdict on a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Already durable; nothing to do
    AlreadyStored,
    /// The tracker kept the attached inline bytes
    StoredInline,
    /// Send one full copy to each assignment
    Replicate { assignments: Vec<NodeAssignment> },
    /// Erasure code with this geometry
    Erasure {
        data_shards: usize,
        parity_shards: usize,
    },
}

/// A storage node chosen for one piece, with the ticket to use there
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub endpoint: String,
    pub node_id: String,
    pub ticket: String,
    pub auth: AuthToken,
    pub issued_at: u64,
}

impl NodeAssignment {
    pub fn authorization(&self) -> PieceAuthorization {
        PieceAuthorization::new(self.ticket.clone(), self.auth.clone(), self.issued_at)
    }
}

/// Shard description reported before placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSummary {
    pub index: u32,
    pub hash: ContentHash,
    pub size: u64,
    pub is_data: bool,
}

/// Where a shard ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlacement {
    pub index: u32,
    pub hash: ContentHash,
    pub size: u64,
    pub is_data: bool,
    pub node_ids: Vec<String>,
    /// First node to acknowledge the shard
    pub primary_node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlacement {
    pub index: u32,
    pub size: u64,
    pub shards: Vec<ShardPlacement>,
}

/// Everything the tracker needs to record a completed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementManifest {
    pub mode: StorageMode,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub partitions: Vec<PartitionPlacement>,
}

/// A node holding a shard, with a retrieve ticket for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLocation {
    pub endpoint: String,
    pub node_id: String,
    pub authz: PieceAuthorization,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedShard {
    pub index: u32,
    pub hash: ContentHash,
    pub size: u64,
    pub is_data: bool,
    pub locations: Vec<ShardLocation>,
}

impl ResolvedShard {
    pub fn piece(&self) -> PieceRef {
        PieceRef::new(self.hash, self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPartition {
    pub index: u32,
    /// Declared partition length, used to strip padding on join
    pub size: u64,
    pub shards: Vec<ResolvedShard>,
}

/// How to get a file back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedFile {
    Inline(Bytes),
    Partitions(Vec<ResolvedPartition>),
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Report a file and learn how (or whether) to store it
    async fn check_existing(&self, file: &FileInfo) -> Result<CheckOutcome>;

    /// Report one encoded partition; returns one assignment per shard, in shard order
    async fn prepare_partition(
        &self,
        key: &ContentHash,
        size: u64,
        partition: u32,
        shards: &[ShardSummary],
    ) -> Result<Vec<NodeAssignment>>;

    /// Record the completed placement. The file is durable once this returns.
    async fn commit_placement(&self, key: &ContentHash, manifest: &PlacementManifest) -> Result<()>;

    /// Where the shards of a stored file live
    async fn resolve_placement(&self, key: &ContentHash, size: u64) -> Result<ResolvedFile>;
}
