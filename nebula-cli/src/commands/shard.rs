//! Offline shard tool
//!
//! `encode` writes every shard of a file to `<file>.<index>` plus a JSON
//! manifest `<file>.manifest.json`; `decode` rebuilds the file from the
//! manifest and whichever shard files are still present and intact;
//! `verify` reports shard health without writing anything.
//!
//! Manifests are untrusted input: every file they name must be a plain
//! relative path inside the manifest's directory.

use anyhow::{Context, Result};
use bytes::Bytes;
use nebula_core::{plan_partitions, ContentHash, ErasureConfig, ErasureEncoder, ShardData};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Upper bound on the output buffer reserved up front from a manifest's size
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardManifest {
    pub file_name: String,
    pub size: u64,
    pub key: ContentHash,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub partitions: Vec<PartitionEntry>,
}

impl ShardManifest {
    pub fn shard_count(&self) -> usize {
        self.partitions.iter().map(|p| p.shards.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
    pub shards: Vec<ShardEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub index: u32,
    /// Shard file name, relative to the manifest
    pub file: String,
    pub hash: ContentHash,
    pub size: u64,
}

pub fn manifest_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{}.manifest.json", file_name))
}

/// `dir/name`, provided `name` cannot escape `dir`
fn contained_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if name.is_empty() || !plain {
        anyhow::bail!("Manifest names an unsafe path: {:?}", name);
    }
    Ok(dir.join(relative))
}

async fn read_manifest(manifest_file: &Path) -> Result<(ShardManifest, PathBuf)> {
    let json = tokio::fs::read(manifest_file)
        .await
        .with_context(|| format!("Failed to read manifest {}", manifest_file.display()))?;
    let manifest: ShardManifest = serde_json::from_slice(&json).context("Invalid manifest")?;
    let dir = manifest_file.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((manifest, dir))
}

/// Read one partition's shard files; unreadable files are left empty
async fn load_partition(
    dir: &Path,
    data_shards: usize,
    partition: &PartitionEntry,
) -> Result<Vec<Option<ShardData>>> {
    let mut slots: Vec<Option<ShardData>> = Vec::with_capacity(partition.shards.len());
    for (position, entry) in partition.shards.iter().enumerate() {
        if entry.index as usize != position {
            anyhow::bail!(
                "Partition {} lists shard {} at position {}",
                partition.index,
                entry.index,
                position
            );
        }
        let slot = match tokio::fs::read(contained_path(dir, &entry.file)?).await {
            Ok(bytes) => Some(ShardData::new(
                entry.index,
                Bytes::from(bytes),
                entry.index as usize >= data_shards,
            )),
            Err(e) => {
                warn!(file = %entry.file, error = %e, "Shard file unavailable");
                None
            }
        };
        slots.push(slot);
    }
    Ok(slots)
}

/// Encode `file` and write its shard files and manifest
pub async fn encode(
    file: &Path,
    data_shards: usize,
    parity_shards: usize,
    max_partition_size: u64,
    out_dir: Option<&Path>,
) -> Result<ShardManifest> {
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("Input path has no usable file name")?
        .to_string();
    let out_dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => file.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let size = data.len() as u64;
    let config = ErasureConfig::new(data_shards, parity_shards)?;
    let encoder = ErasureEncoder::with_config(config)?;

    let mut partitions = Vec::new();
    for partition in plan_partitions(size, max_partition_size)? {
        let range = partition.offset as usize..partition.end() as usize;
        let shards = encoder.encode_parallel(&data[range])?;

        let mut entries = Vec::with_capacity(shards.len());
        for shard in &shards {
            let index = partition.index * config.total_shards() as u32 + shard.index;
            let shard_file = format!("{}.{}", file_name, index);
            tokio::fs::write(out_dir.join(&shard_file), &shard.data)
                .await
                .with_context(|| format!("Failed to write shard {}", shard_file))?;
            entries.push(ShardEntry {
                index: shard.index,
                file: shard_file,
                hash: shard.hash(),
                size: shard.size() as u64,
            });
        }
        debug!(partition = partition.index, shards = entries.len(), "Partition encoded");
        partitions.push(PartitionEntry {
            index: partition.index,
            offset: partition.offset,
            len: partition.len,
            shards: entries,
        });
    }

    let manifest = ShardManifest {
        key: ContentHash::compute_parallel(&data),
        file_name,
        size,
        data_shards,
        parity_shards,
        partitions,
    };
    let json = serde_json::to_vec_pretty(&manifest)?;
    tokio::fs::write(manifest_path(&out_dir, &manifest.file_name), json).await?;
    Ok(manifest)
}

#[derive(Debug)]
pub struct DecodeOutcome {
    pub path: PathBuf,
    pub size: u64,
    /// Shards that were missing or failed their hash check
    pub repaired: usize,
}

/// Rebuild the file described by `manifest_file`
pub async fn decode(manifest_file: &Path, output: Option<&Path>) -> Result<DecodeOutcome> {
    let (manifest, dir) = read_manifest(manifest_file).await?;
    let encoder = ErasureEncoder::new(manifest.data_shards, manifest.parity_shards)?;
    let path = match output {
        Some(path) => path.to_path_buf(),
        None => contained_path(&dir, &manifest.file_name)?,
    };

    let mut out = Vec::with_capacity(manifest.size.min(MAX_PREALLOCATION) as usize);
    let mut repaired = 0;
    for partition in &manifest.partitions {
        let mut slots = load_partition(&dir, manifest.data_shards, partition).await?;
        let hashes: Vec<ContentHash> = partition.shards.iter().map(|s| s.hash).collect();
        let report = encoder.verify_shards(&mut slots, &hashes)?;
        for index in &report.corrupt {
            warn!(partition = partition.index, shard = index, "Shard file is corrupt");
        }
        repaired += report.corrupt.len() + report.missing.len();

        encoder
            .reconstruct(&mut slots)
            .with_context(|| format!("Partition {} cannot be rebuilt", partition.index))?;
        out.extend_from_slice(&encoder.join(&slots, partition.len)?);
    }

    if out.len() as u64 != manifest.size {
        anyhow::bail!(
            "Rebuilt {} bytes but the manifest declares {}",
            out.len(),
            manifest.size
        );
    }
    if !manifest.key.verify(&out) {
        anyhow::bail!("Rebuilt file does not match the recorded content hash");
    }

    tokio::fs::write(&path, &out)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(DecodeOutcome {
        path,
        size: manifest.size,
        repaired,
    })
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub partitions: usize,
    pub missing: usize,
    pub corrupt: usize,
    /// Partitions whose shards all match their hashes but whose parity
    /// does not match their data
    pub inconsistent: Vec<u32>,
}

impl VerifyOutcome {
    pub fn is_healthy(&self) -> bool {
        self.missing == 0 && self.corrupt == 0 && self.inconsistent.is_empty()
    }
}

/// Check every shard named by `manifest_file` without rebuilding anything
pub async fn verify(manifest_file: &Path) -> Result<VerifyOutcome> {
    let (manifest, dir) = read_manifest(manifest_file).await?;
    let encoder = ErasureEncoder::new(manifest.data_shards, manifest.parity_shards)?;

    let mut outcome = VerifyOutcome {
        partitions: manifest.partitions.len(),
        ..VerifyOutcome::default()
    };
    for partition in &manifest.partitions {
        let mut slots = load_partition(&dir, manifest.data_shards, partition).await?;
        let hashes: Vec<ContentHash> = partition.shards.iter().map(|s| s.hash).collect();
        let report = encoder.verify_shards(&mut slots, &hashes)?;
        outcome.missing += report.missing.len();
        outcome.corrupt += report.corrupt.len();

        if report.valid.len() == slots.len() {
            let shards: Vec<ShardData> = slots.into_iter().flatten().collect();
            if !encoder.verify_parity(&shards)? {
                warn!(partition = partition.index, "Parity does not match data");
                outcome.inconsistent.push(partition.index);
            }
        }
    }
    Ok(outcome)
}
