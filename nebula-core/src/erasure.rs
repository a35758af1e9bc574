//! Reed-Solomon Erasure Coding
//!
//! Systematic (k, m) coding over GF(2^8):
//! - k data shards carry the partition bytes, zero-padded to a uniform size
//! - m parity shards are computed from the data shards
//! - any k of the k + m shards reconstruct the partition
//!
//! `m == 0` is accepted and degrades to plain striping: every data shard is
//! then required.

use crate::crypto::ContentHash;
use crate::error::{NebulaError, Result};
use crate::MAX_TOTAL_SHARDS;
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};

/// Erasure coding configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (m)
    pub parity_shards: usize,
}

impl ErasureConfig {
    /// Create a new erasure config
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(NebulaError::Configuration(
                "data_shards must be > 0".to_string(),
            ));
        }
        if data_shards + parity_shards > MAX_TOTAL_SHARDS {
            return Err(NebulaError::Configuration(format!(
                "data_shards + parity_shards must be <= {}, got {}",
                MAX_TOTAL_SHARDS,
                data_shards + parity_shards
            )));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Storage overhead ratio (parity/data)
    pub fn overhead_ratio(&self) -> f64 {
        self.parity_shards as f64 / self.data_shards as f64
    }

    /// Maximum number of failures that can be tolerated
    pub fn max_failures(&self) -> usize {
        self.parity_shards
    }

    /// Size of every shard for a partition of `len` bytes.
    ///
    /// Never zero: an empty partition still produces one-byte shards.
    pub fn shard_size(&self, len: u64) -> usize {
        (len.div_ceil(self.data_shards as u64) as usize).max(1)
    }
}

/// A single shard of erasure-coded data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardData {
    /// Shard index (0 to total_shards-1)
    pub index: u32,
    /// Shard data
    pub data: Bytes,
    /// Whether this is a parity shard
    pub is_parity: bool,
}

impl ShardData {
    /// Create a new shard
    pub fn new(index: u32, data: Bytes, is_parity: bool) -> Self {
        Self {
            index,
            data,
            is_parity,
        }
    }

    /// Get shard size
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Content hash of the shard bytes
    pub fn hash(&self) -> ContentHash {
        ContentHash::compute(&self.data)
    }
}

/// Outcome of checking a shard set against its recorded hashes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardVerification {
    /// Positions whose bytes matched the recorded hash
    pub valid: Vec<usize>,
    /// Positions whose bytes did not match; these were cleared to `None`
    pub corrupt: Vec<usize>,
    /// Positions that were already absent
    pub missing: Vec<usize>,
}

impl ShardVerification {
    /// True when every shard was present and matched
    pub fn all_valid(&self) -> bool {
        self.corrupt.is_empty() && self.missing.is_empty()
    }

    /// Number of shards usable for reconstruction
    pub fn available(&self) -> usize {
        self.valid.len()
    }
}

/// Reed-Solomon encoder/decoder
pub struct ErasureEncoder {
    config: ErasureConfig,
    // None when parity_shards == 0
    codec: Option<ReedSolomon>,
}

impl ErasureEncoder {
    /// Create an encoder for `data_shards` + `parity_shards`
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        Self::with_config(ErasureConfig::new(data_shards, parity_shards)?)
    }

    /// Create a new encoder with custom configuration
    pub fn with_config(config: ErasureConfig) -> Result<Self> {
        let config = ErasureConfig::new(config.data_shards, config.parity_shards)?;
        let codec = if config.parity_shards > 0 {
            Some(ReedSolomon::new(config.data_shards, config.parity_shards)?)
        } else {
            None
        };
        Ok(Self { config, codec })
    }

    /// Get the erasure configuration
    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Encode data into shards
    ///
    /// Returns `k` data shards followed by `m` parity shards.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<ShardData>> {
        let shard_size = self.config.shard_size(data.len() as u64);

        // Pad data to be evenly divisible by data_shards
        let padded_size = shard_size * self.config.data_shards;
        let mut padded_data = data.to_vec();
        padded_data.resize(padded_size, 0);

        let mut shards: Vec<Vec<u8>> = padded_data.chunks(shard_size).map(|c| c.to_vec()).collect();
        for _ in 0..self.config.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        if let Some(codec) = &self.codec {
            codec.encode(&mut shards)?;
        }

        Ok(self.into_shard_data(shards))
    }

    /// Encode data into shards using parallel processing
    ///
    /// More efficient for large partitions (> 1MB)
    pub fn encode_parallel(&self, data: &[u8]) -> Result<Vec<ShardData>> {
        let shard_size = self.config.shard_size(data.len() as u64);

        let padded_size = shard_size * self.config.data_shards;
        let mut padded_data = data.to_vec();
        padded_data.resize(padded_size, 0);

        let mut shards: Vec<Vec<u8>> = padded_data
            .par_chunks(shard_size)
            .map(|c| c.to_vec())
            .collect();
        for _ in 0..self.config.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        if let Some(codec) = &self.codec {
            codec.encode(&mut shards)?;
        }

        let k = self.config.data_shards;
        Ok(shards
            .into_par_iter()
            .enumerate()
            .map(|(i, shard)| ShardData::new(i as u32, Bytes::from(shard), i >= k))
            .collect())
    }

    fn into_shard_data(&self, shards: Vec<Vec<u8>>) -> Vec<ShardData> {
        let k = self.config.data_shards;
        shards
            .into_iter()
            .enumerate()
            .map(|(i, shard)| ShardData::new(i as u32, Bytes::from(shard), i >= k))
            .collect()
    }

    fn check_len(&self, len: usize) -> Result<()> {
        let total = self.config.total_shards();
        if len != total {
            return Err(NebulaError::ShardSizeMismatch {
                expected: total,
                actual: len,
            });
        }
        Ok(())
    }

    /// Check every present shard against its recorded hash.
    ///
    /// Mismatching shards are cleared so that reconstruction treats them as
    /// absent. Absent shards are reported, not rejected.
    pub fn verify_shards(
        &self,
        shards: &mut [Option<ShardData>],
        hashes: &[ContentHash],
    ) -> Result<ShardVerification> {
        self.check_len(shards.len())?;
        self.check_len(hashes.len())?;

        let mut report = ShardVerification::default();
        for (i, (slot, expected)) in shards.iter_mut().zip(hashes).enumerate() {
            match slot {
                Some(shard) if expected.verify(&shard.data) => report.valid.push(i),
                Some(_) => {
                    *slot = None;
                    report.corrupt.push(i);
                }
                None => report.missing.push(i),
            }
        }
        Ok(report)
    }

    /// Verify that parity is consistent with the data shards (complete set only)
    pub fn verify_parity(&self, shards: &[ShardData]) -> Result<bool> {
        if shards.len() != self.config.total_shards() {
            return Ok(false);
        }

        let expected_size = shards.first().map(|s| s.size()).unwrap_or(0);
        if !shards.iter().all(|s| s.size() == expected_size) {
            return Ok(false);
        }

        match &self.codec {
            Some(codec) => {
                let shard_refs: Vec<&[u8]> = shards.iter().map(|s| s.data.as_ref()).collect();
                Ok(codec.verify(&shard_refs)?)
            }
            None => Ok(true),
        }
    }

    /// Fill in the absent positions from any `k` present shards.
    ///
    /// Present shards are left untouched.
    pub fn reconstruct(&self, shards: &mut [Option<ShardData>]) -> Result<()> {
        self.check_len(shards.len())?;

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.config.data_shards {
            return Err(NebulaError::InsufficientShards {
                available,
                required: self.config.data_shards,
            });
        }
        if available == shards.len() {
            return Ok(());
        }

        let shard_size = shards
            .iter()
            .find_map(|s| s.as_ref().map(|s| s.size()))
            .unwrap_or(0);
        if let Some(bad) = shards.iter().flatten().find(|s| s.size() != shard_size) {
            return Err(NebulaError::ShardSizeMismatch {
                expected: shard_size,
                actual: bad.size(),
            });
        }

        let codec = self.codec.as_ref().ok_or(NebulaError::InsufficientShards {
            available,
            required: shards.len(),
        })?;

        let mut shard_vecs: Vec<Option<Vec<u8>>> = shards
            .iter()
            .map(|opt| opt.as_ref().map(|s| s.data.to_vec()))
            .collect();
        codec.reconstruct(&mut shard_vecs)?;

        let k = self.config.data_shards;
        for (i, (slot, rebuilt)) in shards.iter_mut().zip(shard_vecs).enumerate() {
            if slot.is_none() {
                let data = rebuilt.ok_or_else(|| {
                    NebulaError::Internal(format!("shard {} missing after reconstruction", i))
                })?;
                *slot = Some(ShardData::new(i as u32, Bytes::from(data), i >= k));
            }
        }
        Ok(())
    }

    /// Concatenate the data shards and strip padding.
    ///
    /// `original_len` must agree with the shard size, otherwise the shards
    /// belong to a different partition layout and `LengthMismatch` is returned.
    pub fn join(&self, shards: &[Option<ShardData>], original_len: u64) -> Result<Bytes> {
        self.check_len(shards.len())?;

        let k = self.config.data_shards;
        let data_shards: Vec<&ShardData> = shards[..k].iter().flatten().collect();
        if data_shards.len() < k {
            return Err(NebulaError::InsufficientShards {
                available: data_shards.len(),
                required: k,
            });
        }

        let shard_size = data_shards[0].size();
        if shard_size != self.config.shard_size(original_len) {
            return Err(NebulaError::LengthMismatch {
                declared: original_len,
                shard_size,
                data_shards: k,
            });
        }

        let mut result = Vec::with_capacity(shard_size * k);
        for shard in data_shards {
            if shard.size() != shard_size {
                return Err(NebulaError::ShardSizeMismatch {
                    expected: shard_size,
                    actual: shard.size(),
                });
            }
            result.extend_from_slice(&shard.data);
        }

        result.truncate(original_len as usize);
        Ok(Bytes::from(result))
    }

    /// Decode shards back into original data
    ///
    /// Requires at least `data_shards` number of shards.
    /// Missing shards should be represented as `None`.
    pub fn decode(&self, shards: &[Option<ShardData>], original_len: u64) -> Result<Bytes> {
        let mut shards = shards.to_vec();
        self.reconstruct(&mut shards)?;
        self.join(&shards, original_len)
    }
}
