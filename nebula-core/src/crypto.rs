//! Content hashing for Nebula
//!
//! Files and shards are addressed by their Blake3 digest. The same digest is
//! the "content key" a storage node files a piece under.

use crate::error::{NebulaError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a content hash in bytes
pub const HASH_SIZE: usize = 32;

/// Blake3 hash wrapper for content addressing
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    /// Compute Blake3 hash of data
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    /// Compute Blake3 hash of data using multiple threads (for large data)
    pub fn compute_parallel(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update_rayon(data);
        Self(hasher.finalize())
    }

    /// Build from raw digest bytes
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Build from a slice, validating its length
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; HASH_SIZE] = slice.try_into().map_err(|_| {
            NebulaError::InvalidInput(format!(
                "content hash must be {} bytes, got {}",
                HASH_SIZE,
                slice.len()
            ))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        self.0.as_bytes()
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Parse from hex string
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hash = blake3::Hash::from_hex(hex)
            .map_err(|e| NebulaError::InvalidInput(format!("invalid content hash: {}", e)))?;
        Ok(Self(hash))
    }

    /// Verify that data matches this hash (constant-time comparison)
    pub fn verify(&self, data: &[u8]) -> bool {
        self.0 == blake3::hash(data)
    }
}

/// Incremental hasher for content that is read in slices
#[derive(Default)]
pub struct ContentHasher(blake3::Hasher);

impl ContentHasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    pub fn finalize(&self) -> ContentHash {
        ContentHash(self.0.finalize())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Hex in human-readable formats (JSON manifests, TOML), raw bytes on the wire.
impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(self.as_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let hex: String = Deserialize::deserialize(deserializer)?;
            Self::from_hex(&hex).map_err(serde::de::Error::custom)
        } else {
            let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
            Self::from_slice(&bytes).map_err(serde::de::Error::custom)
        }
    }
}
