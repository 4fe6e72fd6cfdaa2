//! Parameter server configuration types

use crate::{Error, Result, ShardIndex};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Main parameter server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PserverConfig {
    /// Shard settings
    pub shard: ShardConfig,

    /// Checkpoint settings
    pub checkpoint: CheckpointConfig,

    /// Metadata store settings
    pub metadata: MetadataConfig,

    /// HTTP transport settings
    pub http: HttpConfig,
}

impl PserverConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::InvalidConfig {
            message: format!("Failed to read {}: {}", path.as_ref().display(), e),
        })?;
        let config: PserverConfig = serde_json::from_str(&raw).map_err(|e| Error::InvalidConfig {
            message: format!("Failed to parse {}: {}", path.as_ref().display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint.interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "checkpoint.interval must be greater than zero".to_string(),
            });
        }
        if self.checkpoint.dir.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "checkpoint.dir must not be empty".to_string(),
            });
        }
        if self.metadata.timeout.is_zero() {
            return Err(Error::InvalidConfig {
                message: "metadata.timeout must be greater than zero".to_string(),
            });
        }
        if self.checkpoint.interval < Duration::from_secs(1) {
            warn!(
                interval_ms = self.checkpoint.interval.as_millis() as u64,
                "Checkpoint interval below one second"
            );
        }
        Ok(())
    }
}

/// Shard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Index of the shard served by this instance
    pub index: ShardIndex,
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Time between checkpoint ticks
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Root directory of the blob storage
    pub storage_root: String,

    /// Directory for checkpoint blobs, relative to `storage_root`
    pub dir: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            storage_root: "./data".to_string(),
            dir: "checkpoints".to_string(),
        }
    }
}

/// Metadata store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Metadata store backend type
    pub backend: MetadataBackend,

    /// Timeout applied to every metadata store call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: MetadataBackend::Local {
                root: "./metadata".to_string(),
            },
            timeout: Duration::from_secs(3),
        }
    }
}

/// Metadata store backend type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetadataBackend {
    /// In-process store, lost on restart
    Memory,

    /// Records kept as files under a local directory
    Local { root: String },
}

/// HTTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to bind the HTTP server
    pub bind_address: String,

    /// Port for the HTTP server
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
