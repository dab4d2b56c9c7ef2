//! Tick-batching request queue.
//!
//! Entries pushed within one `process_delay` window are handed to the batch
//! processor together. Each entry leaves the queue as soon as its settlement
//! settles, whatever the cause.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::promise::Settlement;
use crate::types::RequestId;

/// Boxed future returned by a batch processor.
pub type BatchFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked with each flushed batch.
pub type BatchProcessor<T> = Arc<dyn Fn(Vec<T>) -> BatchFuture + Send + Sync>;

/// Something the queue can track and match against a request id.
pub trait QueueEntry: Clone + Send + 'static {
    /// Value the entry's settlement resolves with.
    type Output: Send + 'static;

    fn request_id(&self) -> RequestId;
    fn settlement(&self) -> &Settlement<Self::Output>;
}

struct QueueState<T> {
    waiting: Vec<T>,
    in_process: Vec<T>,
    flush_scheduled: bool,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    delay: Duration,
    processor: BatchProcessor<T>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Batches entries and tracks them until they settle.
pub struct RequestQueue<T: QueueEntry> {
    shared: Arc<Shared<T>>,
}

impl<T: QueueEntry> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: QueueEntry> RequestQueue<T> {
    pub fn new(delay: Duration, processor: BatchProcessor<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    waiting: Vec::new(),
                    in_process: Vec::new(),
                    flush_scheduled: false,
                }),
                delay,
                processor,
            }),
        }
    }

    /// Queue an entry and schedule a flush if none is pending.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn push(&self, entry: T) {
        let id = entry.request_id();
        let settlement = entry.settlement().clone();

        let schedule = {
            let mut state = self.shared.lock();
            state.waiting.push(entry);
            !std::mem::replace(&mut state.flush_scheduled, true)
        };

        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        settlement.on_settle(move || {
            if let Some(shared) = weak.upgrade() {
                let mut state = shared.lock();
                state.waiting.retain(|e| e.request_id() != id);
                state.in_process.retain(|e| e.request_id() != id);
            }
        });

        if schedule {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(shared.delay).await;
                Self::flush(shared).await;
            });
        }
    }

    async fn flush(shared: Arc<Shared<T>>) {
        let batch = {
            let mut state = shared.lock();
            state.flush_scheduled = false;
            let batch = std::mem::take(&mut state.waiting);
            state.in_process.extend(batch.iter().cloned());
            batch
        };
        if batch.is_empty() {
            return;
        }
        tracing::debug!("Processing batch of {} queued requests", batch.len());
        (shared.processor)(batch).await;
    }

    /// Find a waiting or in-process entry by id.
    pub fn get(&self, id: RequestId) -> Option<T> {
        let state = self.shared.lock();
        state
            .in_process
            .iter()
            .chain(state.waiting.iter())
            .find(|e| e.request_id() == id)
            .cloned()
    }

    pub fn waiting_len(&self) -> usize {
        self.shared.lock().waiting.len()
    }

    pub fn in_process_len(&self) -> usize {
        self.shared.lock().in_process.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FetchError;
    use tokio::sync::mpsc;

    #[derive(Clone)]
    struct Entry {
        id: RequestId,
        settlement: Settlement,
    }

    impl QueueEntry for Entry {
        type Output = crate::types::SeriesResult;

        fn request_id(&self) -> RequestId {
            self.id
        }

        fn settlement(&self) -> &Settlement {
            &self.settlement
        }
    }

    fn entry(id: u64) -> Entry {
        let (settlement, _rx) = Settlement::channel();
        Entry {
            id: RequestId(id),
            settlement,
        }
    }

    fn recording_queue(delay_ms: u64) -> (RequestQueue<Entry>, mpsc::UnboundedReceiver<Vec<u64>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let processor: BatchProcessor<Entry> = Arc::new(move |batch: Vec<Entry>| {
            let _ = tx.send(batch.iter().map(|e| e.id.0).collect());
            Box::pin(async {}) as BatchFuture
        });
        (RequestQueue::new(Duration::from_millis(delay_ms), processor), rx)
    }

    #[tokio::test]
    async fn test_same_window_is_one_batch() {
        let (queue, mut batches) = recording_queue(5);
        queue.push(entry(1));
        queue.push(entry(2));
        queue.push(entry(3));
        assert_eq!(queue.waiting_len(), 3);

        assert_eq!(batches.recv().await, Some(vec![1, 2, 3]));
        assert_eq!(queue.waiting_len(), 0);
        assert_eq!(queue.in_process_len(), 3);
    }

    #[tokio::test]
    async fn test_later_push_starts_new_batch() {
        let (queue, mut batches) = recording_queue(1);
        queue.push(entry(1));
        assert_eq!(batches.recv().await, Some(vec![1]));
        queue.push(entry(2));
        assert_eq!(batches.recv().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_get_and_auto_removal() {
        let (queue, mut batches) = recording_queue(1);
        let first = entry(1);
        let second = entry(2);
        queue.push(first.clone());
        queue.push(second.clone());

        assert!(queue.get(RequestId(2)).is_some());
        second.settlement.reject(FetchError::cancelled_by_user());
        assert!(queue.get(RequestId(2)).is_none());
        assert_eq!(queue.waiting_len(), 1);

        assert_eq!(batches.recv().await, Some(vec![1]));
        assert!(queue.get(RequestId(1)).is_some());
        first.settlement.reject(FetchError::IncompleteData);
        assert!(queue.get(RequestId(1)).is_none());
        assert_eq!(queue.in_process_len(), 0);
    }
}
