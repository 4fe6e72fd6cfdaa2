//! Parameter server core - shared foundation for the shard service
//!
//! Provides the parameter data model, error handling, and configuration
//! used by the storage, checkpoint, and service crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::PserverConfig;
pub use error::{Error, Result};
pub use types::*;
