use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Fixed-capacity multi-producer multi-consumer queue that never blocks the
/// producer: when full, the item being pushed is dropped and counted.
pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T: Send> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues without waiting. A full queue hands the item back.
    pub fn push(&self, item: T) -> Result<(), T> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) | Err(TrySendError::Closed(item)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(item)
            }
        }
    }

    /// Waits up to `wait` for an item. Consumers take turns on the receiver,
    /// so an idle consumer holds it for at most `wait`.
    pub async fn pop(&self, wait: Duration) -> Option<T> {
        let mut rx = match timeout(wait, self.rx.lock()).await {
            Ok(rx) => rx,
            Err(_) => return None,
        };
        timeout(wait, rx.recv()).await.ok().flatten()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
