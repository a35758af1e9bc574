//! Nebula Core Library
//!
//! The pure half of the Nebula data-distribution engine. This crate provides:
//! - Byte-range slicing and file partitioning
//! - Reed-Solomon erasure coding with shard verification and reconstruction
//! - Full replication for small files
//! - Per-operation piece tickets (HMAC-SHA256 over the operation scope)
//! - Blake3 content hashing and the shared error type
//!
//! Nothing in here performs network I/O; the transport and orchestration
//! layers live in `nebula-network` and `nebula-client`.

pub mod crypto;
pub mod erasure;
pub mod error;
pub mod partition;
pub mod replica;
pub mod slice;
pub mod ticket;

pub use crypto::{ContentHash, ContentHasher};
pub use erasure::{ErasureConfig, ErasureEncoder, ShardData, ShardVerification};
pub use error::{NebulaError, Result};
pub use partition::{plan_partitions, Partition};
pub use replica::{recover_replica, ReplicaSet, StorageMode, UploadPolicy};
pub use slice::{slice_count, slice_ranges, ByteRange};
pub use ticket::{unix_now, AuthToken, NodeKey, Operation, TicketCodec, TicketScope};

/// Files strictly smaller than this are stored by full replication.
pub const REPLICA_FILE_SIZE: u64 = 8 * 1024; // 8 KB

/// Files larger than this are split into several partitions.
pub const PARTITION_MAX_SIZE: u64 = 256 * 1024 * 1024; // 256 MB

/// Read size used when hashing or copying files sequentially.
pub const DEFAULT_SLICE_SIZE: u64 = 1024 * 1024; // 1 MB

/// Payload size of one data frame on a piece stream.
pub const STREAM_FRAME_SIZE: usize = 32 * 1024; // 32 KB

/// GF(2^8) Reed-Solomon supports at most 256 shards per partition.
pub const MAX_TOTAL_SHARDS: usize = 256;

/// Accepted distance, in seconds, between a ticket timestamp and the
/// validating node's clock.
pub const DEFAULT_TICKET_WINDOW_SECS: u64 = 600;
