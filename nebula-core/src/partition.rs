//! File partitioning
//!
//! Files above the partition limit are split into `ceil(size / max)`
//! contiguous partitions of `size / n` bytes; the last one absorbs the
//! remainder. Each partition is erasure coded independently.

use crate::error::{NebulaError, Result};
use serde::{Deserialize, Serialize};

/// Contiguous region of a file, identified by its position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
}

impl Partition {
    /// Offset one past the last byte
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Plan the partitions of a file of `size` bytes.
///
/// A file of `size <= max_partition_size` (including an empty file) is a
/// single partition.
pub fn plan_partitions(size: u64, max_partition_size: u64) -> Result<Vec<Partition>> {
    if max_partition_size == 0 {
        return Err(NebulaError::InvalidInput(
            "max partition size must be > 0".to_string(),
        ));
    }
    if size <= max_partition_size {
        return Ok(vec![Partition {
            index: 0,
            offset: 0,
            len: size,
        }]);
    }

    let count = size.div_ceil(max_partition_size);
    let index_limit = u32::MAX as u64;
    if count > index_limit {
        return Err(NebulaError::InvalidInput(format!(
            "{} partitions exceed the index range",
            count
        )));
    }
    let target = size / count;

    let partitions = (0..count)
        .map(|i| {
            let offset = i * target;
            let len = if i + 1 == count { size - offset } else { target };
            Partition {
                index: i as u32,
                offset,
                len,
            }
        })
        .collect();
    Ok(partitions)
}
