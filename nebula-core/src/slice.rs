//! Byte-range slicing
//!
//! Splits `[0, length)` into consecutive half-open ranges of a fixed size,
//! the last range taking whatever remains.

use crate::error::{NebulaError, Result};
use serde::{Deserialize, Serialize};

/// Half-open byte range `[begin, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub begin: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// Number of ranges `slice_ranges` would produce
pub fn slice_count(length: u64, chunk_size: u64) -> Result<u64> {
    if chunk_size == 0 {
        return Err(NebulaError::InvalidInput(
            "chunk size must be > 0".to_string(),
        ));
    }
    Ok(length.div_ceil(chunk_size))
}

/// Cover `[0, length)` with ranges of `chunk_size` bytes.
///
/// An empty input yields no ranges.
pub fn slice_ranges(length: u64, chunk_size: u64) -> Result<Vec<ByteRange>> {
    let count = slice_count(length, chunk_size)?;
    let ranges = (0..count)
        .map(|i| {
            let begin = i * chunk_size;
            ByteRange::new(begin, begin.saturating_add(chunk_size).min(length))
        })
        .collect();
    Ok(ranges)
}
