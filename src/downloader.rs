use crate::config::SchedulerConfig;
use crate::events::EventSink;
use crate::models::DownloadTask;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors of a single transfer attempt. Never leaves the executor.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("downloaded file is empty")]
    EmptyFile,
    #[error("download cancelled")]
    Cancelled,
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    Fail,
    /// Cancelled through the attempt's token.
    Break,
}

/// Performs single HTTP fetches for the scheduler.
#[derive(Debug, Clone)]
pub struct DownloadExecutor {
    client: Client,
    sample_interval: Duration,
}

impl DownloadExecutor {
    pub fn new(config: &SchedulerConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .timeout(config.transfer_timeout())
            .build()?;
        Ok(Self {
            client,
            sample_interval: config.sample_interval(),
        })
    }

    /// Runs one attempt for `task`, writing to its save path.
    ///
    /// The task's size and speed counters are updated as the body streams.
    /// Cancelling `cancel` drops the connection and yields `Break`.
    pub async fn run(
        &self,
        task: &Arc<Mutex<DownloadTask>>,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> TransferOutcome {
        let (task_id, url, save_path) = {
            let t = task.lock().await;
            (t.id, t.info.target_url.clone(), t.info.save_path.clone())
        };

        match self.download_once(task, &url, &save_path, cancel, events).await {
            Ok(()) => {
                debug!(task_id, %url, "download finished");
                TransferOutcome::Success
            }
            Err(DownloadError::Cancelled) => {
                debug!(task_id, %url, "download interrupted");
                TransferOutcome::Break
            }
            Err(e) => {
                if matches!(e, DownloadError::EmptyFile) {
                    let _ = tokio::fs::remove_file(&save_path).await;
                }
                if cancel.is_cancelled() {
                    // The error was raised by the teardown, not by the peer.
                    debug!(task_id, %url, err = %e, "download interrupted");
                    return TransferOutcome::Break;
                }
                warn!(task_id, %url, err = %e, "download failed");
                TransferOutcome::Fail
            }
        }
    }

    /// Best-effort content length from a HEAD request.
    async fn probe_size(&self, url: &str) -> Option<u64> {
        let resp = self.client.head(url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        content_length(&resp)
    }

    async fn download_once(
        &self,
        task: &Arc<Mutex<DownloadTask>>,
        url: &str,
        save_path: &Path,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<(), DownloadError> {
        let probed = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            size = self.probe_size(url) => size,
        };
        if let Some(size) = probed {
            task.lock().await.file_size = size;
        }

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            resp = self.client.get(url).send() => resp?,
        };
        if resp.status() != StatusCode::OK {
            return Err(DownloadError::Status(resp.status()));
        }
        if probed.is_none() {
            if let Some(size) = content_length(&resp) {
                task.lock().await.file_size = size;
            }
        }

        if let Some(parent) = save_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(save_path).await?;

        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + self.sample_interval, self.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut copied: u64 = 0;
        let mut stream = resp.bytes_stream();

        loop {
            tokio::select! {
                biased;
                // Returning drops the body stream, which closes the connection.
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    let snapshot = {
                        let mut t = task.lock().await;
                        t.downloaded_size = copied;
                        t.speed_kbs = speed_kbs(copied, elapsed);
                        t.clone()
                    };
                    events.progress(snapshot, elapsed.as_secs());
                }
                chunk = stream.next() => match chunk {
                    Some(bytes) => {
                        let bytes = bytes?;
                        file.write_all(&bytes).await?;
                        copied += bytes.len() as u64;
                    }
                    None => break,
                },
            }
        }
        file.flush().await?;
        drop(file);

        {
            let mut t = task.lock().await;
            t.downloaded_size = copied;
            t.speed_kbs = speed_kbs(copied, started.elapsed());
        }

        let written = tokio::fs::metadata(save_path).await?.len();
        if written == 0 {
            return Err(DownloadError::EmptyFile);
        }
        Ok(())
    }
}

fn content_length(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Bytes per millisecond, which is close enough to KB/s for tier selection.
pub fn speed_kbs(bytes: u64, elapsed: Duration) -> u64 {
    let millis = elapsed.as_millis().max(1) as u64;
    bytes / millis
}
