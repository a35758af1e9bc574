//! Error types for Nebula
//!
//! One error type shared by every layer, grouped the way callers need to
//! react to it: bad input, transport failure, integrity failure,
//! reconstruction failure, authorization failure.

use thiserror::Error;

/// Result type alias for Nebula operations
pub type Result<T> = std::result::Result<T, NebulaError>;

/// Unified error type for Nebula
#[derive(Error, Debug)]
pub enum NebulaError {
    // ===== Input Errors =====
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("Shard size mismatch: expected {expected}, got {actual}")]
    ShardSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid shard index: {index} (max: {max})")]
    InvalidShardIndex { index: usize, max: usize },

    // ===== Integrity Errors =====
    #[error("Hash verification failed")]
    HashVerificationFailed,

    #[error("Length {declared} does not fit {data_shards} data shards of {shard_size} bytes")]
    LengthMismatch {
        declared: u64,
        shard_size: usize,
        data_shards: usize,
    },

    #[error("No replica matched the expected content hash")]
    NoValidReplica,

    // ===== Authorization Errors =====
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Ticket expired: issued at {issued_at}, now {now}, window {window}s")]
    TicketExpired { issued_at: u64, now: u64, window: u64 },

    // ===== Transport Errors =====
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection timeout to {peer}")]
    ConnectionTimeout { peer: String },

    #[error("Short stream: expected {expected} bytes, got {actual}")]
    ShortStream { expected: u64, actual: u64 },

    #[error("Remote rejected request: {0}")]
    RemoteRejected(String),

    // ===== Metadata Errors =====
    #[error("Metadata service error: {0}")]
    Metadata(String),

    // ===== Control Flow =====
    #[error("Operation cancelled")]
    Cancelled,

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NebulaError {
    /// Whether the file cannot be recovered with its current placement.
    ///
    /// Only a reconstruction that ran out of shards is permanent; every other
    /// failure can be retried by re-running the whole upload or download.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, NebulaError::InsufficientShards { .. })
    }

    /// Errors that describe a single unusable shard rather than a broken
    /// operation: the orchestrators treat these as "shard absent".
    pub fn is_shard_local(&self) -> bool {
        matches!(
            self,
            NebulaError::Transport(_)
                | NebulaError::ConnectionTimeout { .. }
                | NebulaError::ShortStream { .. }
                | NebulaError::RemoteRejected(_)
                | NebulaError::HashVerificationFailed
                | NebulaError::Io(_)
        )
    }
}

impl From<reed_solomon_erasure::Error> for NebulaError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        NebulaError::ErasureCoding(err.to_string())
    }
}

impl From<bincode::Error> for NebulaError {
    fn from(err: bincode::Error) -> Self {
        NebulaError::Serialization(err.to_string())
    }
}
