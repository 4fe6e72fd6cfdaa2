//! Core type definitions for the parameter server shard

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Index of the shard served by one pserver instance
pub type ShardIndex = u32;

/// Metadata store key prefix under which each shard publishes its checkpoint
pub const CHECKPOINT_KEY_PREFIX: &str = "/checkpoints/";

/// Metadata store key holding the current checkpoint pointer of a shard
pub fn checkpoint_key(shard_index: ShardIndex) -> String {
    format!("{}{}", CHECKPOINT_KEY_PREFIX, shard_index)
}

/// Element type of a parameter's content buffer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    Int32 = 0,
    UInt32 = 1,
    Int64 = 2,
    UInt64 = 3,
    Float32 = 4,
    Float64 = 5,
}

impl ElementType {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
            ElementType::Int64 | ElementType::UInt64 | ElementType::Float64 => 8,
        }
    }

    /// Returns true for the floating point element types
    pub fn is_float(&self) -> bool {
        matches!(self, ElementType::Float32 | ElementType::Float64)
    }
}

/// A named piece of data synced with the parameter server
///
/// `content` is a flat little-endian array of `element_type`. The store does
/// not check that its length is a multiple of the element size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Parameter {
    /// Unique name within the shard
    pub name: String,

    /// Element type of the content
    pub element_type: ElementType,

    /// Raw content bytes
    pub content: Bytes,
}

impl Parameter {
    /// Create a new parameter
    pub fn new(name: impl Into<String>, element_type: ElementType, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            element_type,
            content: content.into(),
        }
    }

    /// Number of whole elements in the content buffer
    pub fn len(&self) -> usize {
        self.content.len() / self.element_type.size_bytes()
    }

    /// Returns true if the content buffer holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A parameter together with its optimizer configuration
///
/// The configuration blob is opaque to the store and owned by the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterWithConfig {
    pub param: Parameter,

    #[serde(default)]
    pub config: Bytes,
}

impl ParameterWithConfig {
    pub fn new(param: Parameter, config: impl Into<Bytes>) -> Self {
        Self {
            param,
            config: config.into(),
        }
    }
}

/// Gradient of a parameter, applied through the parameter's optimizer
pub type Gradient = Parameter;

/// One parameter as persisted in a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterCheckpoint {
    /// Parameter weights and configuration at snapshot time
    pub param: ParameterWithConfig,

    /// Serialized optimizer state
    pub state: Bytes,
}

/// Every entry of a shard captured at one instant, ordered by name
pub type CheckpointSnapshot = Vec<ParameterCheckpoint>;

/// Checkpoint pointer published to the metadata store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMeta {
    /// Unique checkpoint identifier, also the blob file name
    pub uuid: String,

    /// Storage path of the checkpoint blob
    pub path: String,

    /// Hex checksum of the blob
    pub checksum: String,

    /// Creation time in nanoseconds since the Unix epoch
    pub timestamp: i64,
}

impl CheckpointMeta {
    /// Create metadata stamped with the current time
    pub fn new(uuid: impl Into<String>, path: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            path: path.into(),
            checksum: checksum.into(),
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        }
    }
}
