// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use download_task_mgr::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Fetch files through the download task scheduler")]
struct Cli {
    /// TOML config file; defaults are used when it does not exist.
    #[arg(short, long, default_value = "download-task-mgr.toml")]
    config: PathBuf,

    /// Pairs of URL and save path.
    #[arg(value_name = "URL SAVE_PATH")]
    pairs: Vec<String>,
}

struct LogEvents;

impl TaskEvents for LogEvents {
    fn on_start(&self, task: &DownloadTask) {
        info!(task_id = task.id, url = %task.info.target_url, channel = ?task.channel, "started");
    }

    fn on_progress(&self, task: &DownloadTask, elapsed_secs: u64) {
        info!(
            task_id = task.id,
            elapsed_secs,
            speed_kbs = task.speed_kbs,
            "progress {:.2}%",
            task.progress() * 100.0
        );
    }

    fn on_success(&self, task: &DownloadTask) {
        info!(task_id = task.id, path = %task.info.save_path.display(), "finished");
    }

    fn on_failure(&self, task: &DownloadTask) {
        warn!(task_id = task.id, url = %task.info.target_url, "gave up");
    }

    fn on_panic(&self, task: &DownloadTask, message: &str) {
        warn!(task_id = task.id, panic = message, "attempt panicked");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if cli.pairs.len() % 2 != 0 {
        bail!("expected URL and SAVE_PATH pairs, got {} arguments", cli.pairs.len());
    }

    let config = SchedulerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let manager = DownloadTaskManager::new(config, Arc::new(LogEvents)).await?;
    manager.run()?;

    for pair in cli.pairs.chunks(2) {
        let id = manager.add_download_task(DownloadInfo::new(pair[0].clone(), pair[1].clone()))?;
        info!(task_id = id, url = %pair[0], "queued");
    }

    // Wait until the store drains or the user interrupts.
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted, unfinished tasks will resume on next start");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if manager.download_task_list().await?.is_empty() {
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
