//! Full replication for small files, and the policy choosing between
//! replication and erasure coding.

use crate::crypto::ContentHash;
use crate::error::{NebulaError, Result};
use crate::{PARTITION_MAX_SIZE, REPLICA_FILE_SIZE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Redundancy strategy for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Replica,
    Erasure,
}

/// Thresholds that decide how a file is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPolicy {
    /// Files strictly smaller than this are replicated
    pub replica_threshold: u64,
    /// Files larger than this are split into partitions
    pub max_partition_size: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            replica_threshold: REPLICA_FILE_SIZE,
            max_partition_size: PARTITION_MAX_SIZE,
        }
    }
}

impl UploadPolicy {
    pub fn mode_for(&self, size: u64) -> StorageMode {
        if size < self.replica_threshold {
            StorageMode::Replica
        } else {
            StorageMode::Erasure
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_partition_size == 0 {
            return Err(NebulaError::Configuration(
                "max_partition_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// `r` identical copies of a small file
#[derive(Debug, Clone)]
pub struct ReplicaSet {
    data: Bytes,
    copies: usize,
    hash: ContentHash,
}

impl ReplicaSet {
    pub fn new(data: Bytes, copies: usize) -> Result<Self> {
        if copies == 0 {
            return Err(NebulaError::InvalidInput(
                "replica count must be > 0".to_string(),
            ));
        }
        let hash = ContentHash::compute(&data);
        Ok(Self { data, copies, hash })
    }

    pub fn copies(&self) -> usize {
        self.copies
    }

    /// Hash shared by every copy
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Yield each copy; clones share the underlying buffer.
    pub fn iter(&self) -> impl Iterator<Item = Bytes> + '_ {
        (0..self.copies).map(|_| self.data.clone())
    }
}

/// First candidate whose bytes match `expected`.
///
/// Copies are never combined; one intact copy is enough.
pub fn recover_replica<I>(candidates: I, expected: &ContentHash) -> Result<Bytes>
where
    I: IntoIterator<Item = Option<Bytes>>,
{
    candidates
        .into_iter()
        .flatten()
        .find(|copy| expected.verify(copy))
        .ok_or(NebulaError::NoValidReplica)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selection() {
        let policy = UploadPolicy::default();
        assert_eq!(policy.mode_for(0), StorageMode::Replica);
        assert_eq!(policy.mode_for(REPLICA_FILE_SIZE - 1), StorageMode::Replica);
        assert_eq!(policy.mode_for(REPLICA_FILE_SIZE), StorageMode::Erasure);
    }

    #[test]
    fn test_replica_set() {
        let data = Bytes::from(vec![9u8; 1024]);
        let set = ReplicaSet::new(data.clone(), 3).unwrap();
        let copies: Vec<Bytes> = set.iter().collect();
        assert_eq!(copies.len(), 3);
        assert!(copies.iter().all(|c| *c == data));
        assert!(set.hash().verify(&data));

        assert!(ReplicaSet::new(data, 0).is_err());
    }

    #[test]
    fn test_recover_skips_missing_and_corrupt() {
        let data = Bytes::from_static(b"one kilobyte, more or less");
        let hash = ContentHash::compute(&data);
        let candidates = vec![None, Some(Bytes::from_static(b"tampered")), Some(data.clone())];
        assert_eq!(recover_replica(candidates, &hash).unwrap(), data);
    }

    #[test]
    fn test_recover_fails_without_valid_copy() {
        let hash = ContentHash::compute(b"original");
        let candidates = vec![Some(Bytes::from_static(b"bad")), None];
        assert!(matches!(
            recover_replica(candidates, &hash),
            Err(NebulaError::NoValidReplica)
        ));
    }
}
