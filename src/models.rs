// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Caller-supplied description of what to fetch and where it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub target_url: String,
    pub origin_tag: String,
    pub bind_name: String,
    pub file_name: String,
    pub continent: String,
    pub country: String,
    pub area: String,
    /// Absolute destination path of the downloaded file.
    pub save_path: PathBuf,
    pub download_type: String,
    pub origin_region: String,
    pub target_region: String,
}

impl DownloadInfo {
    /// Shorthand for the two fields every task needs.
    pub fn new(target_url: impl Into<String>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            target_url: target_url.into(),
            save_path: save_path.into(),
            ..Self::default()
        }
    }
}

/// Scheduling state of a task that is still owned by the scheduler.
///
/// Success and failure are not states: a task reaching either is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    UnStart,
    Downloading,
    Break,
}

/// Represents the complete, persistent state of a single download task.
/// The whole struct is the value written to the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: u64,
    #[serde(flatten)]
    pub info: DownloadInfo,
    pub status: TaskStatus,
    /// Content length learned from the HEAD probe, zero when unknown.
    pub file_size: u64,
    pub downloaded_size: u64,
    pub speed_kbs: u64,
    /// Retries already consumed.
    pub try_times: u32,
    /// When the current attempt began.
    pub start_time: Option<DateTime<Utc>>,
    /// Index of the speed tier the task was last demoted to.
    #[serde(skip)]
    pub channel: Option<usize>,
}

impl DownloadTask {
    pub fn new(id: u64, info: DownloadInfo) -> Self {
        Self {
            id,
            info,
            status: TaskStatus::UnStart,
            file_size: 0,
            downloaded_size: 0,
            speed_kbs: 0,
            try_times: 0,
            start_time: None,
            channel: None,
        }
    }

    /// Calculates download progress as a fraction from 0.0 to 1.0.
    pub fn progress(&self) -> f32 {
        if self.file_size == 0 {
            0.0
        } else {
            self.downloaded_size as f32 / self.file_size as f32
        }
    }

    /// Clears per-attempt counters so the task can be admitted again.
    pub fn reset_attempt(&mut self) {
        self.status = TaskStatus::UnStart;
        self.downloaded_size = 0;
        self.speed_kbs = 0;
        self.start_time = None;
    }

    /// Milliseconds the current attempt has been running, zero if it has not started.
    pub fn attempt_age_ms(&self, now: DateTime<Utc>) -> u64 {
        self.start_time
            .map(|start| (now - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}
