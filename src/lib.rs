//! Durable, speed-adaptive download task scheduler.
//!
//! New tasks pass a bounded intake gate; attempts that stay slow are
//! demoted into speed tiers with their own concurrency limits. Unfinished
//! tasks are kept in an embedded store and resumed after a restart.

pub mod channel;
pub mod config;
pub mod downloader;
pub mod events;
pub mod manager;
pub mod models;
pub mod monitor;
pub mod queue;
pub mod state_manager;

/// Convenient re-exports of the types an embedding service needs.
pub mod prelude {
    pub use crate::config::{ChannelConfig, SchedulerConfig};
    pub use crate::events::{NoopEvents, TaskEvents};
    pub use crate::manager::{DownloadTaskManager, ManagerError};
    pub use crate::models::{DownloadInfo, DownloadTask, TaskStatus};
}
