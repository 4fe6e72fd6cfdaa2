//! HTTP server with graceful shutdown
//!
//! Serves the shard API until a shutdown signal arrives, then stops the
//! checkpoint loop before returning.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use pserver_core::config::HttpConfig;
use pserver_core::{Error, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use crate::http_api;
use crate::service::PserverService;

/// Parameter server HTTP front end
pub struct PserverServer {
    addr: SocketAddr,
    service: PserverService,
}

impl PserverServer {
    pub fn new(addr: SocketAddr, service: PserverService) -> Self {
        Self { addr, service }
    }

    /// Create from the `http` section of the configuration
    pub fn from_config(config: &HttpConfig, service: PserverService) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_address, config.port)
            .parse()
            .map_err(|e| Error::InvalidConfig {
                message: format!("invalid bind address {}: {e}", config.bind_address),
            })?;
        Ok(Self::new(addr, service))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run the server until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.run_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` completes
    pub async fn run_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let service = self.service.clone();
        let router = http_api::create_router(Arc::new(self.service));

        info!(address = %local_addr, shard_index = service.shard_index(), "Parameter server listening");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        service.shutdown().await;

        served.map_err(|e| {
            error!(error = %e, "Server error");
            Error::from(e)
        })?;

        info!("Parameter server shutdown complete");
        Ok(())
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
