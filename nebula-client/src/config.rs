//! Configuration management for the Nebula client
//!
//! Supports loading from TOML files and environment variables.

use nebula_core::{UploadPolicy, PARTITION_MAX_SIZE, REPLICA_FILE_SIZE, STREAM_FRAME_SIZE};
use nebula_network::PieceClientConfig;
use nebula_protocol::DEFAULT_MAX_FRAME_LENGTH;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// Room for the message envelope around a data frame
const FRAME_OVERHEAD: usize = 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Piece transfer settings
    #[serde(default)]
    pub transfer: TransferSettings,

    /// Redundancy policy thresholds
    #[serde(default)]
    pub policy: PolicySettings,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        if t.connect_timeout_secs == 0 || t.io_timeout_secs == 0 || t.operation_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts must be at least one second".to_string(),
            ));
        }
        if t.operation_timeout_secs < t.io_timeout_secs {
            return Err(ConfigError::ValidationError(
                "operation_timeout_secs cannot be shorter than io_timeout_secs".to_string(),
            ));
        }
        if t.frame_size == 0 || t.frame_size + FRAME_OVERHEAD > t.max_frame_length {
            return Err(ConfigError::ValidationError(format!(
                "frame_size must be between 1 and {}",
                t.max_frame_length.saturating_sub(FRAME_OVERHEAD)
            )));
        }
        if t.max_concurrent_transfers == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrent_transfers cannot be 0".to_string(),
            ));
        }
        if self.policy.max_partition_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_partition_size cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to all settings
    pub fn with_env_overrides(mut self) -> Self {
        fn env_u64(name: &str) -> Option<u64> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = env_u64("NEBULA_CONNECT_TIMEOUT_SECS") {
            self.transfer.connect_timeout_secs = v;
        }
        if let Some(v) = env_u64("NEBULA_IO_TIMEOUT_SECS") {
            self.transfer.io_timeout_secs = v;
        }
        if let Some(v) = env_u64("NEBULA_OPERATION_TIMEOUT_SECS") {
            self.transfer.operation_timeout_secs = v;
        }
        if let Some(v) = env_u64("NEBULA_FRAME_SIZE") {
            self.transfer.frame_size = v as usize;
        }
        if let Some(v) = env_u64("NEBULA_MAX_CONCURRENT_TRANSFERS") {
            self.transfer.max_concurrent_transfers = v as usize;
        }
        if let Some(v) = env_u64("NEBULA_REPLICA_THRESHOLD") {
            self.policy.replica_threshold = v;
        }
        if let Some(v) = env_u64("NEBULA_MAX_PARTITION_SIZE") {
            self.policy.max_partition_size = v;
        }

        self
    }

    pub fn piece_client_config(&self) -> PieceClientConfig {
        PieceClientConfig {
            connect_timeout: Duration::from_secs(self.transfer.connect_timeout_secs),
            io_timeout: Duration::from_secs(self.transfer.io_timeout_secs),
            frame_size: self.transfer.frame_size,
            max_frame_length: self.transfer.max_frame_length,
        }
    }

    /// Bound on one whole piece transfer
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.operation_timeout_secs)
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            replica_threshold: self.policy.replica_threshold,
            max_partition_size: self.policy.max_partition_size,
        }
    }
}

/// Piece transfer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    /// Whole store or retrieve, however its frames trickle in
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Payload bytes per data frame
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    /// Shard transfers in flight per partition
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            frame_size: default_frame_size(),
            max_frame_length: default_max_frame_length(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_io_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    300
}

fn default_frame_size() -> usize {
    STREAM_FRAME_SIZE
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

fn default_max_concurrent_transfers() -> usize {
    8
}

/// Redundancy policy thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Files strictly smaller than this are replicated
    #[serde(default = "default_replica_threshold")]
    pub replica_threshold: u64,

    /// Files larger than this are split into partitions
    #[serde(default = "default_max_partition_size")]
    pub max_partition_size: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            replica_threshold: default_replica_threshold(),
            max_partition_size: default_max_partition_size(),
        }
    }
}

fn default_replica_threshold() -> u64 {
    REPLICA_FILE_SIZE
}

fn default_max_partition_size() -> u64 {
    PARTITION_MAX_SIZE
}
