use crate::config::ChannelConfig;
use crate::queue::TaskQueue;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// An admission scope: a token pool and the queue that feeds it.
#[derive(Debug)]
pub struct Lane<T> {
    name: String,
    permits: Arc<Semaphore>,
    capacity: usize,
    queue: TaskQueue<T>,
}

impl<T> Lane<T> {
    pub fn new(name: impl Into<String>, max_concurrency: usize, queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrency)),
            capacity: max_concurrency,
            queue: TaskQueue::new(queue_capacity),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn permits(&self) -> &Arc<Semaphore> {
        &self.permits
    }

    pub fn queue(&self) -> &TaskQueue<T> {
        &self.queue
    }

    pub fn max_concurrency(&self) -> usize {
        self.capacity
    }

    /// Transfers currently holding one of this lane's tokens.
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

/// A speed tier.
#[derive(Debug)]
pub struct DownloadChannel<T> {
    speed_limit_kbs: u64,
    lane: Lane<T>,
}

impl<T> DownloadChannel<T> {
    pub fn new(config: &ChannelConfig, queue_capacity: usize) -> Self {
        Self {
            speed_limit_kbs: config.speed_limit_kbs,
            lane: Lane::new(
                format!("channel-{}kbs", config.speed_limit_kbs),
                config.max_concurrency,
                queue_capacity,
            ),
        }
    }

    pub fn speed_limit_kbs(&self) -> u64 {
        self.speed_limit_kbs
    }

    pub fn lane(&self) -> &Lane<T> {
        &self.lane
    }
}

/// Index of the first (slowest) tier whose ceiling is above `speed_kbs`.
/// `limits` must be ascending.
pub fn select_channel<I>(limits: I, speed_kbs: u64) -> Option<usize>
where
    I: IntoIterator<Item = u64>,
{
    limits.into_iter().position(|limit| limit > speed_kbs)
}
