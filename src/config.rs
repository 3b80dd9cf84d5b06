// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One speed tier: transfers slower than `speed_limit_kbs` may be demoted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub speed_limit_kbs: u64,
    pub max_concurrency: usize,
}

impl ChannelConfig {
    pub const fn new(speed_limit_kbs: u64, max_concurrency: usize) -> Self {
        Self {
            speed_limit_kbs,
            max_concurrency,
        }
    }
}

/// Slow tiers run more transfers at once than fast ones.
pub const DEFAULT_CHANNELS: [ChannelConfig; 5] = [
    ChannelConfig::new(30, 15),
    ChannelConfig::new(100, 10),
    ChannelConfig::new(500, 6),
    ChannelConfig::new(1500, 4),
    ChannelConfig::new(2500, 3),
];

/// Scheduler configuration. Missing keys in a config file fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Directory holding the task store, created on first run.
    pub store_dir: PathBuf,
    /// Tokens of the intake dispatcher.
    pub intake_concurrency: usize,
    /// Depth of the intake queue and of every tier idle queue.
    pub queue_capacity: usize,
    pub scan_interval_ms: u64,
    /// A running attempt younger than this is never demoted.
    pub demotion_grace_ms: u64,
    pub max_demotions_per_scan: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
    pub transfer_timeout_secs: u64,
    pub sample_interval_ms: u64,
    pub user_agent: String,
    /// Ascending by `speed_limit_kbs`.
    pub channels: Vec<ChannelConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./downloadldb"),
            intake_concurrency: 7,
            queue_capacity: 10240,
            scan_interval_ms: 5000,
            demotion_grace_ms: 5000,
            max_demotions_per_scan: 3,
            max_retries: 3,
            connect_timeout_ms: 10_000,
            transfer_timeout_secs: 12 * 60 * 60,
            sample_interval_ms: 1000,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            channels: DEFAULT_CHANNELS.to_vec(),
        }
    }
}

impl SchedulerConfig {
    /// Loads a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    pub fn with_channels(mut self, channels: Vec<ChannelConfig>) -> Self {
        self.channels = channels;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.intake_concurrency == 0 {
            return invalid("intake_concurrency must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.scan_interval_ms == 0 || self.sample_interval_ms == 0 {
            return invalid("scan and sample intervals must be non-zero");
        }
        if self.channels.is_empty() {
            return invalid("at least one channel is required");
        }
        for pair in self.channels.windows(2) {
            if pair[0].speed_limit_kbs >= pair[1].speed_limit_kbs {
                return invalid("channels must be strictly ascending by speed_limit_kbs");
            }
        }
        if let Some(bad) = self
            .channels
            .iter()
            .find(|c| c.speed_limit_kbs == 0 || c.max_concurrency == 0)
        {
            return Err(ConfigError::Invalid(format!(
                "channel {} KB/s needs a non-zero speed limit and concurrency",
                bad.speed_limit_kbs
            )));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}
