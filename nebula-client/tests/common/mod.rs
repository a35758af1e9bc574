//! Shared fixtures for the orchestrator tests: a cluster of real piece
//! servers on loopback and an in-memory tracker that places pieces on them.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nebula_client::{
    CheckOutcome, FileInfo, MetadataService, NodeAssignment, PlacementManifest, ResolvedFile,
    ResolvedPartition, ResolvedShard, ShardLocation, ShardSummary,
};
use nebula_core::{
    unix_now, AuthToken, ContentHash, NebulaError, NodeKey, Operation, Result, TicketCodec,
};
use nebula_network::{MemoryPieceStore, NodeIdentity, PieceServer, PieceServerConfig, PieceStore};
use nebula_protocol::{NodeCodec, NodeMessage, PieceAuthorization, PieceRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub struct TestNode {
    pub node_id: String,
    pub endpoint: String,
    pub key: NodeKey,
    pub store: Arc<MemoryPieceStore>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<Result<()>>>,
}

impl TestNode {
    /// Flip one bit of a stored piece, keeping its length
    pub fn corrupt(&self, key: &ContentHash) {
        let mut data = self
            .store
            .get(key)
            .unwrap()
            .expect("piece not on node")
            .to_vec();
        data[0] ^= 0xff;
        self.store.put(*key, Bytes::from(data)).unwrap();
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub async fn start(count: usize) -> Self {
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let node_id = format!("node-{}", i);
            let key = NodeKey::new(uuid::Uuid::new_v4().as_bytes().to_vec());
            let store = Arc::new(MemoryPieceStore::new());
            let server = PieceServer::bind(
                PieceServerConfig::new("127.0.0.1:0".parse().unwrap()),
                store.clone(),
                NodeIdentity::new(node_id.clone(), key.clone()),
            )
            .await
            .unwrap();
            let endpoint = server.local_addr().unwrap().to_string();
            let shutdown = CancellationToken::new();
            let handle = tokio::spawn(server.run_until(shutdown.clone()));
            nodes.push(TestNode {
                node_id,
                endpoint,
                key,
                store,
                shutdown,
                handle: Some(handle),
            });
        }
        Self { nodes }
    }

    /// Take a node offline; returns once its listener is closed
    pub async fn stop(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        node.shutdown.cancel();
        if let Some(handle) = node.handle.take() {
            handle.await.unwrap().unwrap();
        }
    }

    pub fn node(&self, node_id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .expect("unknown node")
    }

    pub fn tracker(
        &self,
        replicas: usize,
        data_shards: usize,
        parity_shards: usize,
    ) -> MemoryTracker {
        MemoryTracker {
            nodes: Mutex::new(
                self.nodes
                    .iter()
                    .map(|n| (n.node_id.clone(), n.endpoint.clone(), n.key.clone()))
                    .collect(),
            ),
            replicas,
            data_shards,
            parity_shards,
            keep_inline: false,
            state: Mutex::new(TrackerState::default()),
        }
    }
}

#[derive(Default)]
struct TrackerState {
    inline: HashMap<ContentHash, Bytes>,
    manifests: HashMap<ContentHash, PlacementManifest>,
    commits: usize,
}

/// Tracker that assigns shard `i` of partition `p` to node `(p * n + i) % nodes`
pub struct MemoryTracker {
    nodes: Mutex<Vec<(String, String, NodeKey)>>,
    replicas: usize,
    data_shards: usize,
    parity_shards: usize,
    keep_inline: bool,
    state: Mutex<TrackerState>,
}

impl MemoryTracker {
    pub fn keeping_inline(mut self) -> Self {
        self.keep_inline = true;
        self
    }

    pub fn manifest(&self, key: &ContentHash) -> Option<PlacementManifest> {
        self.state.lock().manifests.get(key).cloned()
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    /// Send all later traffic for `node_id` to `endpoint`
    pub fn reroute(&self, node_id: &str, endpoint: &str) {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .iter_mut()
            .find(|(id, _, _)| id == node_id)
            .expect("unknown node");
        node.1 = endpoint.to_string();
    }

    fn node(&self, node_id: &str) -> Result<(String, String, NodeKey)> {
        self.nodes
            .lock()
            .iter()
            .find(|(id, _, _)| id == node_id)
            .cloned()
            .ok_or_else(|| NebulaError::Metadata(format!("unknown node {}", node_id)))
    }

    fn mint(key: &NodeKey, operation: Operation, piece: &PieceRef) -> PieceAuthorization {
        let ticket = uuid::Uuid::new_v4().to_string();
        let authz = PieceAuthorization::new(ticket, AuthToken(Vec::new()), unix_now());
        let auth = TicketCodec::issue(&authz.scope(operation, piece), &authz.ticket, key);
        PieceAuthorization { auth, ..authz }
    }

    fn assign(&self, index: usize, piece: &PieceRef) -> NodeAssignment {
        let (node_id, endpoint, key) = {
            let nodes = self.nodes.lock();
            nodes[index % nodes.len()].clone()
        };
        let authz = Self::mint(&key, Operation::Store, piece);
        NodeAssignment {
            endpoint,
            node_id,
            ticket: authz.ticket,
            auth: authz.auth,
            issued_at: authz.timestamp,
        }
    }
}

#[async_trait]
impl MetadataService for MemoryTracker {
    async fn check_existing(&self, file: &FileInfo) -> Result<CheckOutcome> {
        {
            let state = self.state.lock();
            if state.inline.contains_key(&file.key) || state.manifests.contains_key(&file.key) {
                return Ok(CheckOutcome::AlreadyStored);
            }
        }
        match &file.inline_data {
            Some(data) if self.keep_inline => {
                self.state.lock().inline.insert(file.key, data.clone());
                Ok(CheckOutcome::StoredInline)
            }
            Some(_) => {
                let piece = PieceRef::new(file.key, file.size);
                let assignments = (0..self.replicas).map(|i| self.assign(i, &piece)).collect();
                Ok(CheckOutcome::Replicate { assignments })
            }
            None => Ok(CheckOutcome::Erasure {
                data_shards: self.data_shards,
                parity_shards: self.parity_shards,
            }),
        }
    }

    async fn prepare_partition(
        &self,
        _key: &ContentHash,
        _size: u64,
        partition: u32,
        shards: &[ShardSummary],
    ) -> Result<Vec<NodeAssignment>> {
        let base = partition as usize * shards.len();
        Ok(shards
            .iter()
            .map(|shard| {
                let piece = PieceRef::new(shard.hash, shard.size);
                self.assign(base + shard.index as usize, &piece)
            })
            .collect())
    }

    async fn commit_placement(
        &self,
        key: &ContentHash,
        manifest: &PlacementManifest,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.manifests.insert(*key, manifest.clone());
        state.commits += 1;
        Ok(())
    }

    async fn resolve_placement(&self, key: &ContentHash, _size: u64) -> Result<ResolvedFile> {
        let manifest = {
            let state = self.state.lock();
            if let Some(data) = state.inline.get(key) {
                return Ok(ResolvedFile::Inline(data.clone()));
            }
            state
                .manifests
                .get(key)
                .cloned()
                .ok_or_else(|| NebulaError::Metadata(format!("unknown file {}", key)))?
        };

        let mut partitions = Vec::with_capacity(manifest.partitions.len());
        for partition in &manifest.partitions {
            let mut shards = Vec::with_capacity(partition.shards.len());
            for shard in &partition.shards {
                let piece = PieceRef::new(shard.hash, shard.size);
                let mut locations = Vec::new();
                for node_id in &shard.node_ids {
                    let (node_id, endpoint, node_key) = self.node(node_id)?;
                    locations.push(ShardLocation {
                        authz: Self::mint(&node_key, Operation::Retrieve, &piece),
                        endpoint,
                        node_id,
                    });
                }
                shards.push(ResolvedShard {
                    index: shard.index,
                    hash: shard.hash,
                    size: shard.size,
                    is_data: shard.is_data,
                    locations,
                });
            }
            partitions.push(ResolvedPartition {
                index: partition.index,
                size: partition.size,
                shards,
            });
        }
        Ok(ResolvedFile::Partitions(partitions))
    }
}

/// Deterministic, non-repeating-looking test content
pub fn sample(len: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

pub fn write_sample(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data = sample(len);
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

/// Accepts connections and reads whatever arrives, but never answers
pub struct SilentNode {
    pub endpoint: String,
    /// Signalled on every accepted connection
    pub connected: Arc<Notify>,
}

pub async fn silent_node() -> SilentNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let connected = Arc::new(Notify::new());
    let notify = connected.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            notify.notify_one();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, NodeCodec::new());
                while let Some(Ok(_)) = framed.next().await {}
            });
        }
    });
    SilentNode {
        endpoint,
        connected,
    }
}

/// Answers any request with one byte of piece data every `interval`,
/// so no single frame read ever times out
pub async fn dripping_node(interval: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, NodeCodec::new());
                if framed.next().await.is_none() {
                    return;
                }
                loop {
                    tokio::time::sleep(interval).await;
                    let drip = NodeMessage::Data(Bytes::from_static(b"x"));
                    if framed.send(drip).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    endpoint
}
