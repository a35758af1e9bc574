//! Transfer events
//!
//! An optional observer sees partition and shard outcomes as they happen.
//! Observers run on the orchestrator task and must not block.

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A partition was fully placed (upload) or written out (download)
    PartitionCompleted { index: u32, total: u32 },
    /// A shard could not be stored or fetched from a node
    ShardFailed {
        partition: u32,
        shard: u32,
        node_id: String,
        error: String,
    },
}

pub type EventObserver = Arc<dyn Fn(&TransferEvent) + Send + Sync>;

pub(crate) fn emit(observer: &Option<EventObserver>, event: TransferEvent) {
    if let Some(observer) = observer {
        observer(&event);
    }
}
