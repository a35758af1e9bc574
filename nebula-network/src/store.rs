//! Piece storage behind a storage node
//!
//! How a node persists pieces is its own business; the server only needs
//! this small synchronous interface. [`MemoryPieceStore`] backs tests and
//! `nebula serve`.

use bytes::Bytes;
use nebula_core::{ContentHash, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Synchronous piece storage keyed by content key
pub trait PieceStore: Send + Sync {
    /// Store (or replace) a piece
    fn put(&self, key: ContentHash, data: Bytes) -> Result<()>;

    /// Fetch a piece
    fn get(&self, key: &ContentHash) -> Result<Option<Bytes>>;

    /// Size of a stored piece, if present
    fn size_of(&self, key: &ContentHash) -> Result<Option<u64>>;

    /// Number of stored pieces
    fn piece_count(&self) -> Result<usize>;
}

/// In-memory piece store. Not persistent.
#[derive(Default)]
pub struct MemoryPieceStore {
    pieces: RwLock<HashMap<ContentHash, Bytes>>,
    bytes_used: AtomicU64,
}

impl MemoryPieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::SeqCst)
    }

}

impl PieceStore for MemoryPieceStore {
    fn put(&self, key: ContentHash, data: Bytes) -> Result<()> {
        let data_len = data.len() as u64;
        let mut pieces = self.pieces.write();

        // If replacing, subtract old size
        if let Some(old) = pieces.insert(key, data) {
            self.bytes_used.fetch_sub(old.len() as u64, Ordering::SeqCst);
        }
        self.bytes_used.fetch_add(data_len, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, key: &ContentHash) -> Result<Option<Bytes>> {
        Ok(self.pieces.read().get(key).cloned())
    }

    fn size_of(&self, key: &ContentHash) -> Result<Option<u64>> {
        Ok(self.pieces.read().get(key).map(|p| p.len() as u64))
    }

    fn piece_count(&self) -> Result<usize> {
        Ok(self.pieces.read().len())
    }
}
