//! End-to-end training simulation over the HTTP API
//!
//! Several trainers push gradients to one shard concurrently, then the shard
//! restarts from its checkpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use checkpoint::CheckpointManagerConfig;
use pserver::{PserverServer, PserverService, SgdOptimizerFactory};
use pserver_core::{ElementType, Parameter, ParameterWithConfig};
use storage::{LocalStorage, MemoryMetadataStore, MetadataStore, StorageBackend};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct RunningShard {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<pserver_core::Result<()>>,
}

impl RunningShard {
    async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await??;
        Ok(())
    }
}

// Start a shard on a random port, recovering from whatever the stores hold
async fn start_shard(
    storage: Arc<LocalStorage>,
    metadata: Arc<MemoryMetadataStore>,
    interval: Duration,
) -> Result<RunningShard> {
    let config = CheckpointManagerConfig {
        interval,
        ..Default::default()
    };
    let recovered = PserverService::recover(&config, &*storage, &*metadata).await?;
    let service = PserverService::new(
        config,
        Arc::new(SgdOptimizerFactory),
        storage as Arc<dyn StorageBackend>,
        metadata as Arc<dyn MetadataStore>,
        recovered,
    )?;

    let port = portpicker::pick_unused_port().ok_or_else(|| anyhow!("no ports free"))?;
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;

    let (tx, rx) = oneshot::channel();
    let server = PserverServer::new(addr, service);
    let task = tokio::spawn(server.run_with_shutdown(listener, async {
        rx.await.ok();
    }));

    Ok(RunningShard {
        addr,
        shutdown: tx,
        task,
    })
}

/// Minimal HTTP/1.1 client returning status code and body
async fn request(addr: SocketAddr, method: &str, path: &str, body: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    let req = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(req.as_bytes()).await?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;

    let status = raw
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed response"))?
        .parse::<u16>()?;
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

fn f32_param(name: &str, values: &[f32]) -> Parameter {
    let content: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    Parameter::new(name, ElementType::Float32, content)
}

fn f32_values(content: &[u8]) -> Vec<f32> {
    content
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

async fn fetch(addr: SocketAddr, name: &str) -> Result<Vec<f32>> {
    let (status, body) = request(addr, "GET", &format!("/api/params/{name}"), "").await?;
    assert_eq!(status, 200, "{body}");
    let param: Parameter = serde_json::from_str(&body)?;
    Ok(f32_values(&param.content))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_trainer_training_simulation() -> Result<()> {
    const TRAINERS: usize = 4;
    const STEPS: usize = 25;

    let dir = TempDir::new()?;
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let metadata = Arc::new(MemoryMetadataStore::new());
    let shard = start_shard(storage.clone(), metadata.clone(), Duration::from_millis(50)).await?;
    let addr = shard.addr;

    // Gradients are rejected until initialization finishes
    let grad = serde_json::to_string(&f32_param("layer0", &[1.0, 1.0]))?;
    let (status, _) = request(addr, "POST", "/api/grads", &grad).await?;
    assert_eq!(status, 503);

    for name in ["layer0", "layer1"] {
        let init = ParameterWithConfig::new(
            f32_param(name, &[0.0, 0.0]),
            Bytes::from_static(br#"{"learning_rate":0.5}"#),
        );
        let (status, body) =
            request(addr, "POST", "/api/params", &serde_json::to_string(&init)?).await?;
        assert_eq!(status, 200, "{body}");
    }

    // A reader issued before finish waits for it
    let early_read = tokio::spawn(fetch(addr, "layer1"));
    sleep(Duration::from_millis(50)).await;
    assert!(!early_read.is_finished());

    let (status, _) = request(addr, "POST", "/api/params/finish", "").await?;
    assert_eq!(status, 200);
    assert_eq!(early_read.await??, vec![0.0, 0.0]);

    let (status, body) = request(addr, "POST", "/api/params/finish", "").await?;
    assert_eq!(status, 409);
    assert!(body.contains("already initialized"));

    let mut trainers = Vec::new();
    for t in 0..TRAINERS {
        trainers.push(tokio::spawn(async move {
            let name = if t % 2 == 0 { "layer0" } else { "layer1" };
            let grad = serde_json::to_string(&f32_param(name, &[1.0, -1.0]))?;
            for _ in 0..STEPS {
                let (status, body) = request(addr, "POST", "/api/grads", &grad).await?;
                assert_eq!(status, 200, "{body}");
            }
            Ok::<_, anyhow::Error>(())
        }));
    }
    for trainer in trainers {
        trainer.await??;
    }

    // Each layer received STEPS gradients from each of its two trainers
    let expected = 0.5 * (STEPS * TRAINERS / 2) as f32;
    assert_eq!(fetch(addr, "layer0").await?, vec![-expected, expected]);
    assert_eq!(fetch(addr, "layer1").await?, vec![-expected, expected]);

    let unknown = serde_json::to_string(&f32_param("layer9", &[1.0]))?;
    let (status, _) = request(addr, "POST", "/api/grads", &unknown).await?;
    assert_eq!(status, 404);

    // Let the periodic loop persist the final weights
    sleep(Duration::from_millis(200)).await;
    let (status, body) = request(addr, "GET", "/api/status", "").await?;
    assert_eq!(status, 200);
    let status: serde_json::Value = serde_json::from_str(&body)?;
    assert!(status["checkpoints_succeeded"].as_u64().unwrap_or(0) >= 1);
    shard.stop().await?;

    let restarted = start_shard(storage, metadata, Duration::from_secs(60)).await?;
    let (status, _) = request(restarted.addr, "POST", "/api/params/finish", "").await?;
    assert_eq!(status, 200);
    assert_eq!(
        fetch(restarted.addr, "layer0").await?,
        vec![-expected, expected]
    );
    restarted.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_health_and_status() -> Result<()> {
    let dir = TempDir::new()?;
    let shard = start_shard(
        Arc::new(LocalStorage::new(dir.path())),
        Arc::new(MemoryMetadataStore::new()),
        Duration::from_secs(60),
    )
    .await?;

    let (status, body) = request(shard.addr, "GET", "/api/health", "").await?;
    assert_eq!(status, 200);
    assert!(body.contains("ok"));

    let (status, body) = request(shard.addr, "GET", "/api/status", "").await?;
    assert_eq!(status, 200);
    let status: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(status["initialized"], false);
    assert_eq!(status["parameters"], 0);

    shard.stop().await?;
    Ok(())
}
