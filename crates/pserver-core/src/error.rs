//! Error types for the parameter server shard

use thiserror::Error;

/// Result type alias using the parameter server Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the parameter server shard
#[derive(Error, Debug)]
pub enum Error {
    // Initialization errors
    #[error("pserver already initialized")]
    AlreadyInitialized,

    #[error("pserver not fully initialized")]
    Uninitialized,

    // Parameter errors
    #[error("parameter: {name} does not exist")]
    ParameterNotFound { name: String },

    #[error("Optimizer error: {message}")]
    Optimizer { message: String },

    // Checkpoint errors
    #[error("checkpoint not found for shard {shard_index}")]
    CheckpointNotFound { shard_index: u32 },

    #[error("checkpoint file checksum validation failed: {path} (expected {expected}, computed {computed})")]
    ChecksumMismatch {
        path: String,
        expected: String,
        computed: String,
    },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Metadata store errors
    #[error("Metadata store error: {message}")]
    MetadataStore { message: String },

    // Encoding errors
    #[error("Encoding error: {0}")]
    Encoding(String),

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the caller may retry the failed operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Uninitialized
                | Error::Storage { .. }
                | Error::MetadataStore { .. }
                | Error::Timeout { .. }
        )
    }

    /// Returns true if this error indicates a fatal condition
    ///
    /// A shard must not start serving when recovery hits one of these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ChecksumMismatch { .. } | Error::InvalidConfig { .. } | Error::Encoding(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
