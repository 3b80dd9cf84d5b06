use tokio::sync::{mpsc, Mutex};

/// Bounded FIFO feeding one dispatcher.
///
/// Pushing waits while the queue is full. Only one consumer is expected,
/// but `pop` is safe to call concurrently.
#[derive(Debug)]
pub struct TaskQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> TaskQueue<T> {
    /// Create a new empty queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Add an item to the back of the queue.
    pub async fn push(&self, item: T) {
        // The receiver lives as long as the queue, so the channel cannot be closed here.
        let _ = self.tx.send(item).await;
    }

    /// Take the item at the front, waiting until one is available.
    pub async fn pop(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Number of items currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
