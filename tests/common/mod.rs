#![allow(dead_code)]

use download_task_mgr::prelude::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Minimal HTTP/1.1 origin.
///
/// Routes: `/bytes/<n>` serves n bytes, `/empty` serves an empty 200,
/// `/missing` answers 404, `/hang` sends headers and then stalls,
/// `/gate` holds its 16-byte body until [`TestServer::release`] lets it go.
pub struct TestServer {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    gate: Arc<Semaphore>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let gate = Arc::new(Semaphore::new(0));
        let server_hits = hits.clone();
        let server_gate = gate.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let hits = server_hits.clone();
                let gate = server_gate.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, hits, gate).await;
                });
            }
        });
        Self { addr, hits, gate }
    }

    /// Lets `n` waiting `/gate` responses finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// GET requests seen for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

async fn serve(
    mut stream: TcpStream,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    gate: Arc<Semaphore>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf).to_string();
    let mut parts = head.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let is_head = method == "HEAD";
    if !is_head {
        *hits.lock().unwrap().entry(path.clone()).or_default() += 1;
    }

    if path == "/missing" {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
    } else if path == "/empty" {
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
    } else if path == "/hang" {
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10000000\r\nConnection: close\r\n\r\n")
            .await?;
        if !is_head {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    } else if path == "/gate" {
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 16\r\nConnection: close\r\n\r\n")
            .await?;
        if !is_head {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            stream.write_all(&[b'g'; 16]).await?;
        }
    } else if let Some(size) = path.strip_prefix("/bytes/").and_then(|n| n.parse::<usize>().ok()) {
        let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {size}\r\nConnection: close\r\n\r\n");
        stream.write_all(header.as_bytes()).await?;
        if !is_head {
            stream.write_all(&vec![b'x'; size]).await?;
        }
    } else {
        stream
            .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Records every callback.
#[derive(Default)]
pub struct Recorder {
    pub started: Mutex<Vec<DownloadTask>>,
    pub succeeded: Mutex<Vec<DownloadTask>>,
    pub failed: Mutex<Vec<DownloadTask>>,
}

impl TaskEvents for Recorder {
    fn on_start(&self, task: &DownloadTask) {
        self.started.lock().unwrap().push(task.clone());
    }

    fn on_success(&self, task: &DownloadTask) {
        self.succeeded.lock().unwrap().push(task.clone());
    }

    fn on_failure(&self, task: &DownloadTask) {
        self.failed.lock().unwrap().push(task.clone());
    }
}

impl Recorder {
    pub fn succeeded_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.succeeded.lock().unwrap().iter().map(|t| t.id).collect();
        ids.sort();
        ids
    }
}

/// Short intervals so scans and samples happen within a test's lifetime.
pub fn test_config(store_dir: &Path) -> SchedulerConfig {
    let mut config = SchedulerConfig::default().with_store_dir(store_dir);
    config.scan_interval_ms = 200;
    config.demotion_grace_ms = 400;
    config.sample_interval_ms = 100;
    config.connect_timeout_ms = 2000;
    config
}

/// Polls `check` until it returns true or ten seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Waits until the store holds exactly `expected` tasks and returns them.
pub async fn wait_for_store_len(
    manager: &DownloadTaskManager,
    expected: usize,
) -> Vec<DownloadTask> {
    let mut tasks = Vec::new();
    for _ in 0..500 {
        tasks = manager.download_task_list().await.unwrap();
        if tasks.len() == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tasks
}
