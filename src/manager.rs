// src/manager.rs

use crate::channel::{DownloadChannel, Lane};
use crate::config::{ConfigError, SchedulerConfig};
use crate::downloader::{DownloadExecutor, TransferOutcome};
use crate::events::{EventSink, TaskEvents};
use crate::models::{DownloadInfo, DownloadTask, TaskStatus};
use crate::monitor::{DemotionPolicy, RunningSample};
use crate::state_manager::{StateError, TaskStore};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio::task::JoinError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// A task shared between its queue slot, the running-set and its transfer.
pub type SharedTask = Arc<Mutex<DownloadTask>>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("invalid task: {0}")]
    InvalidTask(&'static str),
    #[error("download task manager is already running")]
    AlreadyRunning,
    #[error("download task manager has been shut down")]
    ShutDown,
}

/// Admission scope a dispatcher serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Intake,
    Channel(usize),
}

struct RunningEntry {
    task: SharedTask,
    cancel: CancellationToken,
}

/// The scheduler. Owns every queue, token pool, the id counter and the store.
pub struct DownloadTaskManager {
    config: SchedulerConfig,
    store: TaskStore,
    executor: DownloadExecutor,
    events: EventSink,
    intake: Lane<SharedTask>,
    channels: Vec<DownloadChannel<SharedTask>>,
    channel_limits: Vec<u64>,
    policy: DemotionPolicy,
    running: DashMap<u64, RunningEntry>,
    current_id: std::sync::Mutex<u64>,
    recovered: std::sync::Mutex<Vec<DownloadTask>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl DownloadTaskManager {
    /// Validates `config`, opens the task store and loads unfinished tasks.
    ///
    /// Loaded tasks keep their ids and are queued again by [`run`](Self::run).
    pub async fn new(
        config: SchedulerConfig,
        events: Arc<dyn TaskEvents>,
    ) -> Result<Arc<Self>, ManagerError> {
        config.validate()?;
        let store = TaskStore::open(&config.store_dir).await?;
        let executor = DownloadExecutor::new(&config)?;

        let mut recovered = store.list_all().await?;
        let mut max_id = 0;
        for task in recovered.iter_mut() {
            max_id = max_id.max(task.id);
            task.reset_attempt();
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), max_id, "found unfinished download tasks");
        }

        let intake = Lane::new("intake", config.intake_concurrency, config.queue_capacity);
        let channels: Vec<_> = config
            .channels
            .iter()
            .map(|c| DownloadChannel::new(c, config.queue_capacity))
            .collect();
        let channel_limits = channels.iter().map(|c| c.speed_limit_kbs()).collect();
        let policy = DemotionPolicy {
            grace_ms: config.demotion_grace_ms,
            max_per_scan: config.max_demotions_per_scan,
        };

        Ok(Arc::new(Self {
            config,
            store,
            executor,
            events: EventSink::new(events),
            intake,
            channels,
            channel_limits,
            policy,
            running: DashMap::new(),
            current_id: std::sync::Mutex::new(max_id),
            recovered: std::sync::Mutex::new(recovered),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }))
    }

    /// Accepts a new task and returns its id.
    ///
    /// Persisting and queueing happen in the background; a failure there is
    /// only logged.
    pub fn add_download_task(self: &Arc<Self>, info: DownloadInfo) -> Result<u64, ManagerError> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::ShutDown);
        }
        if info.target_url.is_empty() {
            return Err(ManagerError::InvalidTask("empty target url"));
        }
        if info.save_path.as_os_str().is_empty() {
            return Err(ManagerError::InvalidTask("empty save path"));
        }

        let task = DownloadTask::new(self.next_id(), info);
        let task_id = task.id;
        debug!(task_id, url = %task.info.target_url, "adding download task");

        let this = self.clone();
        self.tracker.spawn(async move {
            this.persist(&task).await;
            this.enqueue(&this.intake, Arc::new(Mutex::new(task))).await;
        });
        Ok(task_id)
    }

    /// Snapshot of every task that has not completed yet, ascending by id.
    pub async fn download_task_list(&self) -> Result<Vec<DownloadTask>, ManagerError> {
        Ok(self.store.list_all().await?)
    }

    /// Starts the intake dispatcher, one dispatcher per channel and the scan loop,
    /// then queues the tasks recovered from the store.
    pub fn run(self: &Arc<Self>) -> Result<(), ManagerError> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyRunning);
        }

        self.tracker.spawn(self.clone().dispatch_loop(Scope::Intake));
        for idx in 0..self.channels.len() {
            self.tracker.spawn(self.clone().dispatch_loop(Scope::Channel(idx)));
        }
        self.tracker.spawn(self.clone().scan_loop());

        let recovered = std::mem::take(
            &mut *self.recovered.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if !recovered.is_empty() {
            info!(count = recovered.len(), "requeueing recovered download tasks");
            let this = self.clone();
            self.tracker.spawn(async move {
                for task in recovered {
                    this.enqueue(&this.intake, Arc::new(Mutex::new(task))).await;
                }
            });
        }
        info!(
            intake = self.config.intake_concurrency,
            channels = ?self.channel_limits,
            "download task manager running"
        );
        Ok(())
    }

    /// Stops admission, interrupts running transfers and waits until every
    /// interrupted task has been written back to the store.
    ///
    /// Interrupted tasks are picked up again on the next start.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(running = self.running.len(), "shutting down download task manager");
            self.shutdown.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        debug!("download task manager stopped");
    }

    /// Tasks waiting in the intake queue.
    pub fn pending_intake(&self) -> usize {
        self.intake.queue().len()
    }

    /// Tasks waiting in a channel's idle queue.
    pub fn pending_in_channel(&self, idx: usize) -> Option<usize> {
        self.channels.get(idx).map(|c| c.lane().queue().len())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Snapshots of the attempts currently in flight.
    pub async fn running_tasks(&self) -> Vec<DownloadTask> {
        let shared: Vec<SharedTask> = self.running.iter().map(|e| e.task.clone()).collect();
        let mut tasks = Vec::with_capacity(shared.len());
        for task in shared {
            tasks.push(task.lock().await.clone());
        }
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Speed ceilings of the configured channels, in KB/s.
    pub fn channel_limits(&self) -> &[u64] {
        &self.channel_limits
    }

    fn next_id(&self) -> u64 {
        let mut current = self.current_id.lock().unwrap_or_else(PoisonError::into_inner);
        *current = current.wrapping_add(1);
        *current
    }

    fn lane(&self, scope: Scope) -> &Lane<SharedTask> {
        match scope {
            Scope::Intake => &self.intake,
            Scope::Channel(idx) => self.channels[idx].lane(),
        }
    }

    async fn persist(&self, task: &DownloadTask) {
        if let Err(e) = self.store.put(task).await {
            error!(task_id = task.id, err = %e, "failed to persist download task");
        }
    }

    /// Queues `task` on `lane`, giving up if the scheduler stops first.
    ///
    /// The task is already in the store, so a dropped push only defers it
    /// to the next start.
    async fn enqueue(&self, lane: &Lane<SharedTask>, task: SharedTask) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!(lane = lane.name(), "scheduler stopped before task was queued");
            }
            _ = lane.queue().push(task) => {}
        }
    }

    async fn forget(&self, task_id: u64) {
        if let Err(e) = self.store.delete(task_id).await {
            error!(task_id, err = %e, "failed to delete download task from store");
        }
    }

    /// Admits queued tasks while tokens are available.
    async fn dispatch_loop(self: Arc<Self>, scope: Scope) {
        let lane = self.lane(scope);
        debug!(lane = lane.name(), slots = lane.max_concurrency(), "dispatcher started");
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = lane.permits().clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let task = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                task = lane.queue().pop() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            // Leave a task popped during shutdown to the store.
            if self.shutdown.is_cancelled() {
                break;
            }

            let cancel = self.shutdown.child_token();
            let snapshot = {
                let mut t = task.lock().await;
                t.status = TaskStatus::Downloading;
                t.start_time = Some(Utc::now());
                t.clone()
            };
            self.running.insert(
                snapshot.id,
                RunningEntry {
                    task: task.clone(),
                    cancel: cancel.clone(),
                },
            );
            debug!(
                task_id = snapshot.id,
                lane = lane.name(),
                in_use = lane.in_use(),
                try_times = snapshot.try_times,
                "download admitted"
            );
            self.events.start(snapshot);

            let this = self.clone();
            self.tracker.spawn(async move {
                let outcome = this.attempt(&task, &cancel).await;
                this.finish(task, outcome, permit).await;
            });
        }
        debug!(lane = lane.name(), "dispatcher stopped");
    }

    /// Runs the transfer in its own task so a panic is contained.
    async fn attempt(&self, task: &SharedTask, cancel: &CancellationToken) -> TransferOutcome {
        let handle = {
            let executor = self.executor.clone();
            let events = self.events.clone();
            let task = task.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { executor.run(&task, &cancel, &events).await })
        };
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let snapshot = task.lock().await.clone();
                self.events.panic(snapshot, panic_message(e));
                TransferOutcome::Fail
            }
        }
    }

    /// Reconciles an attempt's outcome with the store and the queues.
    ///
    /// `permit` is the admission token the attempt ran under. It is released
    /// before any requeue, since a full queue only drains once its dispatcher
    /// can admit again.
    async fn finish(
        &self,
        task: SharedTask,
        outcome: TransferOutcome,
        permit: OwnedSemaphorePermit,
    ) {
        let mut t = task.lock().await;
        let task_id = t.id;
        self.running.remove(&task_id);
        drop(permit);

        match outcome {
            TransferOutcome::Success => {
                let snapshot = t.clone();
                drop(t);
                self.forget(task_id).await;
                info!(
                    task_id,
                    url = %snapshot.info.target_url,
                    size = snapshot.downloaded_size,
                    "download succeeded"
                );
                self.events.success(snapshot);
            }
            TransferOutcome::Fail if t.try_times >= self.config.max_retries => {
                let snapshot = t.clone();
                drop(t);
                self.forget(task_id).await;
                warn!(
                    task_id,
                    url = %snapshot.info.target_url,
                    try_times = snapshot.try_times,
                    "download abandoned after retries"
                );
                self.events.failure(snapshot);
            }
            TransferOutcome::Fail => {
                t.try_times += 1;
                t.reset_attempt();
                // A hard failure drops the tier assignment.
                t.channel = None;
                let snapshot = t.clone();
                drop(t);
                self.persist(&snapshot).await;
                if self.shutdown.is_cancelled() {
                    return;
                }
                debug!(task_id, try_times = snapshot.try_times, "retrying download");
                self.enqueue(&self.intake, task).await;
            }
            TransferOutcome::Break => {
                t.reset_attempt();
                let channel = t.channel;
                let snapshot = t.clone();
                drop(t);
                self.persist(&snapshot).await;
                if self.shutdown.is_cancelled() {
                    return;
                }
                match channel.and_then(|idx| self.channels.get(idx).map(|c| (idx, c))) {
                    Some((idx, channel)) => {
                        debug!(task_id, channel = idx, "download moved to channel");
                        self.enqueue(channel.lane(), task).await;
                    }
                    None => {
                        warn!(task_id, "interrupted download has no channel, requeueing at intake");
                        self.enqueue(&self.intake, task).await;
                    }
                }
            }
        }
    }

    async fn scan_loop(self: Arc<Self>) {
        let period = self.config.scan_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.scan_once().await;
        }
        debug!("speed monitor stopped");
    }

    /// One speed monitor cycle. Returns how many attempts were demoted.
    pub async fn scan_once(&self) -> usize {
        let pending = self.pending_intake();
        if pending == 0 {
            return 0;
        }

        let entries: HashMap<u64, SharedTask> = self
            .running
            .iter()
            .map(|e| (*e.key(), e.task.clone()))
            .collect();

        let now = Utc::now();
        let mut samples = Vec::with_capacity(entries.len());
        for task in entries.values() {
            let t = task.lock().await;
            if t.status == TaskStatus::Downloading {
                samples.push(RunningSample {
                    task_id: t.id,
                    speed_kbs: t.speed_kbs,
                    age_ms: t.attempt_age_ms(now),
                });
            }
        }
        // Keep the order stable for equal speeds.
        samples.sort_by_key(|s| s.task_id);

        let mut demoted = 0;
        for demotion in self.policy.select(&samples, &self.channel_limits, pending) {
            let Some(task) = entries.get(&demotion.task_id) else {
                continue;
            };
            let mut t = task.lock().await;
            // The attempt may have ended, or restarted, since the snapshot.
            let Some(cancel) = self.running.get(&t.id).map(|e| e.cancel.clone()) else {
                continue;
            };
            if t.status != TaskStatus::Downloading {
                continue;
            }
            t.status = TaskStatus::Break;
            t.channel = Some(demotion.channel);
            drop(t);
            cancel.cancel();
            demoted += 1;
            info!(
                task_id = demotion.task_id,
                speed_kbs = demotion.speed_kbs,
                channel_kbs = self.channel_limits[demotion.channel],
                "demoting slow download"
            );
        }
        demoted
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::events::NoopEvents;

    async fn manager(dir: &std::path::Path) -> Arc<DownloadTaskManager> {
        let config = SchedulerConfig::default().with_store_dir(dir);
        DownloadTaskManager::new(config, Arc::new(NoopEvents)).await.unwrap()
    }

    #[tokio::test]
    async fn ids_increase_and_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        assert_eq!(mgr.next_id(), 1);
        assert_eq!(mgr.next_id(), 2);

        *mgr.current_id.lock().unwrap() = u64::MAX - 1;
        assert_eq!(mgr.next_id(), u64::MAX);
        assert_eq!(mgr.next_id(), 0);
        assert_eq!(mgr.next_id(), 1);
    }

    #[tokio::test]
    async fn rejects_incomplete_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        assert!(matches!(
            mgr.add_download_task(DownloadInfo::new("", "/tmp/x")),
            Err(ManagerError::InvalidTask(_))
        ));
        assert!(matches!(
            mgr.add_download_task(DownloadInfo::new("http://h/x", "")),
            Err(ManagerError::InvalidTask(_))
        ));
    }

    #[tokio::test]
    async fn run_twice_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.run().unwrap();
        assert!(matches!(mgr.run(), Err(ManagerError::AlreadyRunning)));
        mgr.shutdown().await;
        assert!(matches!(
            mgr.add_download_task(DownloadInfo::new("http://h/x", "/tmp/x")),
            Err(ManagerError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig::default()
            .with_store_dir(dir.path())
            .with_channels(vec![ChannelConfig::new(0, 1)]);
        let result = DownloadTaskManager::new(config, Arc::new(NoopEvents)).await;
        assert!(matches!(result, Err(ManagerError::Config(_))));
    }

    #[tokio::test]
    async fn recovered_ids_advance_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TaskStore::open(dir.path()).await.unwrap();
            let mut task = DownloadTask::new(41, DownloadInfo::new("http://h/a", "/tmp/a"));
            task.status = TaskStatus::Downloading;
            store.put(&task).await.unwrap();
        }
        let mgr = manager(dir.path()).await;
        assert_eq!(mgr.next_id(), 42);
        let recovered = mgr.recovered.lock().unwrap().clone();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, TaskStatus::UnStart);
    }

    #[tokio::test]
    async fn scan_without_pending_demand_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let mut task = DownloadTask::new(1, DownloadInfo::new("http://h/a", "/tmp/a"));
        task.status = TaskStatus::Downloading;
        task.start_time = Some(Utc::now() - chrono::Duration::seconds(60));
        let cancel = CancellationToken::new();
        mgr.running.insert(
            1,
            RunningEntry {
                task: Arc::new(Mutex::new(task)),
                cancel: cancel.clone(),
            },
        );
        assert_eq!(mgr.scan_once().await, 0);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn scan_demotes_slow_attempt_into_matching_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        let mut entries = Vec::new();
        for (id, speed) in [(1u64, 10u64), (2, 250), (3, 5000)] {
            let mut task = DownloadTask::new(id, DownloadInfo::new("http://h/a", "/tmp/a"));
            task.status = TaskStatus::Downloading;
            task.speed_kbs = speed;
            task.start_time = Some(Utc::now() - chrono::Duration::seconds(60));
            let shared = Arc::new(Mutex::new(task));
            let cancel = CancellationToken::new();
            mgr.running.insert(
                id,
                RunningEntry {
                    task: shared.clone(),
                    cancel: cancel.clone(),
                },
            );
            entries.push((shared, cancel));
        }
        // One waiting task allows exactly one demotion.
        mgr.intake
            .queue()
            .push(Arc::new(Mutex::new(DownloadTask::new(9, DownloadInfo::default()))))
            .await;

        assert_eq!(mgr.scan_once().await, 1);
        let slowest = entries[0].0.lock().await.clone();
        assert_eq!(slowest.status, TaskStatus::Break);
        assert_eq!(slowest.channel, Some(0));
        assert!(entries[0].1.is_cancelled());
        assert!(!entries[1].1.is_cancelled());
        assert!(!entries[2].1.is_cancelled());
    }
}
