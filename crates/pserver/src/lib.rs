//! Parameter server shard for distributed ML training
//!
//! This crate serves one shard of a model's parameters:
//! - **Initialization**: trainers register parameters, then finish once
//! - **Updates**: gradients are applied through per-parameter optimizers
//! - **Reads**: parameter reads wait until initialization has finished
//! - **Checkpointing**: a background loop persists the shard periodically
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pserver::{PserverServer, PserverService, SgdOptimizerFactory};
//!
//! #[tokio::main]
//! async fn main() -> pserver_core::Result<()> {
//!     let service = PserverService::new(config, Arc::new(SgdOptimizerFactory), storage, metadata, None)?;
//!     PserverServer::new("0.0.0.0:8080".parse().unwrap(), service).run().await
//! }
//! ```

pub mod gate;
pub mod http_api;
pub mod optimizer;
pub mod server;
pub mod service;
pub mod store;

pub use gate::InitGate;
pub use optimizer::{Optimizer, OptimizerFactory, SgdConfig, SgdOptimizer, SgdOptimizerFactory};
pub use server::PserverServer;
pub use service::{PserverService, ServiceStatus};
pub use store::ParameterStore;
