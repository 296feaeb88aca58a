//! FIFO hand-off of job ids from the façade to the single launcher worker.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

/// Unbounded single-consumer queue of job ids.
///
/// The queue does not deduplicate; callers consult the registry's membership
/// sets before enqueueing.
pub struct RunQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    pending: AtomicUsize,
}

impl RunQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn enqueue(&self, id: impl Into<String>) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        // The receiver lives in `self`, so the channel cannot be closed here.
        if self.tx.send(id.into()).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Wait for the next id. Only the launcher worker calls this.
    pub async fn dequeue(&self) -> Option<String> {
        let mut rx = self.rx.lock().await;
        let id = rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(id)
    }

    /// Number of ids enqueued and not yet dequeued.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = RunQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.enqueue("c");
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().await.as_deref(), Some("a"));
        assert_eq!(queue.dequeue().await.as_deref(), Some("b"));
        assert_eq!(queue.dequeue().await.as_deref(), Some("c"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_does_not_deduplicate() {
        let queue = RunQueue::new();
        queue.enqueue("a");
        queue.enqueue("a");
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_producer() {
        let queue = Arc::new(RunQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.enqueue("late");
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("late"));
    }
}
