use crate::models::DownloadTask;
use std::sync::Arc;
use tracing::{error, warn};

/// Hooks the embedding service implements to observe task lifecycle.
///
/// Every method runs on the blocking pool with its own copy of the task, so
/// an implementation may block or panic without affecting the scheduler.
pub trait TaskEvents: Send + Sync + 'static {
    /// An attempt was admitted and is about to start.
    fn on_start(&self, _task: &DownloadTask) {}

    /// Sampled once per interval while a transfer streams.
    fn on_progress(&self, _task: &DownloadTask, _elapsed_secs: u64) {}

    fn on_success(&self, _task: &DownloadTask) {}

    /// The retry budget is exhausted and the task was dropped.
    fn on_failure(&self, _task: &DownloadTask) {}

    /// An attempt panicked. The task is retried like any failed attempt.
    fn on_panic(&self, _task: &DownloadTask, _message: &str) {}
}

/// Callbacks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl TaskEvents for NoopEvents {}

/// Fire-and-forget front for a [`TaskEvents`] implementation.
#[derive(Clone)]
pub struct EventSink {
    handler: Arc<dyn TaskEvents>,
}

impl EventSink {
    pub fn new(handler: Arc<dyn TaskEvents>) -> Self {
        Self { handler }
    }

    fn dispatch<F>(&self, hook: &'static str, task: DownloadTask, f: F)
    where
        F: FnOnce(&dyn TaskEvents, &DownloadTask) + Send + 'static,
    {
        let handler = self.handler.clone();
        let task_id = task.id;
        let handle = tokio::task::spawn_blocking(move || f(handler.as_ref(), &task));
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(task_id, hook, "task event handler panicked");
                }
            }
        });
    }

    pub fn start(&self, task: DownloadTask) {
        self.dispatch("on_start", task, |h, t| h.on_start(t));
    }

    pub fn progress(&self, task: DownloadTask, elapsed_secs: u64) {
        self.dispatch("on_progress", task, move |h, t| h.on_progress(t, elapsed_secs));
    }

    pub fn success(&self, task: DownloadTask) {
        self.dispatch("on_success", task, |h, t| h.on_success(t));
    }

    pub fn failure(&self, task: DownloadTask) {
        self.dispatch("on_failure", task, |h, t| h.on_failure(t));
    }

    pub fn panic(&self, task: DownloadTask, message: String) {
        error!(task_id = task.id, %message, "download attempt panicked");
        self.dispatch("on_panic", task, move |h, t| h.on_panic(t, &message));
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}
