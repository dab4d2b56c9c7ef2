//! Settle-once fetch results with a progress channel.
//!
//! The engine (or a provider) holds a [`Settlement`]; the caller holds the
//! matching [`FetchHandle`]. A settlement can emit any number of progress
//! events while pending, then exactly one resolution or rejection.
//! Both default to carrying a [`SeriesResult`].

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use tokio::sync::mpsc;

use crate::types::{FetchError, FetchResult, RequestId, SeriesResult};

/// One observable step of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent<T = SeriesResult> {
    /// Partial data, usually straight from the cache.
    Progress(T),
    Resolved(T),
    Rejected(FetchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Resolved,
    Rejected,
}

type Callback = Box<dyn FnOnce() + Send>;

struct State<T> {
    phase: Phase,
    events: Option<mpsc::UnboundedSender<FetchEvent<T>>>,
    on_settle: Vec<Callback>,
}

/// Producer side of a fetch result. Cheap to clone.
pub struct Settlement<T = SeriesResult> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Settlement<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Settlement<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settlement")
            .field("phase", &self.lock().phase)
            .finish()
    }
}

impl<T> Settlement<T> {
    /// A pending settlement and the receiver its events go to.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FetchEvent<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let settlement = Self {
            state: Arc::new(Mutex::new(State {
                phase: Phase::Pending,
                events: Some(tx),
                on_settle: Vec::new(),
            })),
        };
        (settlement, rx)
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Emit a progress event. Ignored once settled.
    pub fn notify(&self, result: T) -> bool {
        let state = self.lock();
        if state.phase != Phase::Pending {
            return false;
        }
        if let Some(tx) = &state.events {
            let _ = tx.send(FetchEvent::Progress(result));
        }
        true
    }

    pub fn resolve(&self, result: T) -> bool {
        self.settle(Phase::Resolved, FetchEvent::Resolved(result))
    }

    pub fn reject(&self, error: FetchError) -> bool {
        self.settle(Phase::Rejected, FetchEvent::Rejected(error))
    }

    pub fn is_settled(&self) -> bool {
        self.lock().phase != Phase::Pending
    }

    /// Run `callback` once this settles, or right away if it already has.
    pub fn on_settle(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        if state.phase == Phase::Pending {
            state.on_settle.push(Box::new(callback));
            return;
        }
        drop(state);
        callback();
    }

    fn settle(&self, phase: Phase, event: FetchEvent<T>) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.phase != Phase::Pending {
                return false;
            }
            state.phase = phase;
            if let Some(tx) = state.events.take() {
                let _ = tx.send(event);
            }
            std::mem::take(&mut state.on_settle)
        };
        // Callbacks may re-enter the engine, so they run unlocked.
        for callback in callbacks {
            callback();
        }
        true
    }
}

/// Caller side of one fetch.
///
/// Dropping the handle cancels the fetch if it is still pending.
#[derive(Debug)]
pub struct FetchHandle<T = SeriesResult> {
    id: RequestId,
    settlement: Settlement<T>,
    events: mpsc::UnboundedReceiver<FetchEvent<T>>,
}

impl<T> FetchHandle<T> {
    pub(crate) fn new(
        id: RequestId,
        settlement: Settlement<T>,
        events: mpsc::UnboundedReceiver<FetchEvent<T>>,
    ) -> Self {
        Self {
            id,
            settlement,
            events,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Next progress or final event. `None` after the final event was taken.
    pub async fn next_event(&mut self) -> Option<FetchEvent<T>> {
        self.events.recv().await
    }

    /// Wait for the final outcome, skipping progress events.
    pub async fn result(mut self) -> FetchResult<T> {
        while let Some(event) = self.events.recv().await {
            match event {
                FetchEvent::Progress(_) => continue,
                FetchEvent::Resolved(result) => return Ok(result),
                FetchEvent::Rejected(error) => return Err(error),
            }
        }
        Err(FetchError::Cancelled("fetch finished without a result".into()))
    }

    /// Reject the fetch with the user-cancellation reason.
    pub fn cancel(&self) -> bool {
        self.settlement.reject(FetchError::cancelled_by_user())
    }

    pub fn is_settled(&self) -> bool {
        self.settlement.is_settled()
    }
}

impl<T> Drop for FetchHandle<T> {
    fn drop(&mut self) {
        self.settlement
            .reject(FetchError::Cancelled("fetch handle dropped".into()));
    }
}

/// Run `work` unless every settlement in `watched` settles first.
///
/// Returns `None` when the work was dropped because nobody waits for it.
pub(crate) async fn unless_all_settled<'a, T, F>(
    watched: impl IntoIterator<Item = &'a Settlement<T>>,
    work: F,
) -> Option<F::Output>
where
    T: 'a,
    F: Future,
{
    let abort = Arc::new(Notify::new());
    let watched: Vec<&Settlement<T>> = watched.into_iter().collect();
    let remaining = Arc::new(AtomicUsize::new(watched.len()));
    for settlement in watched {
        let abort = abort.clone();
        let remaining = remaining.clone();
        settlement.on_settle(move || {
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                abort.notify_one();
            }
        });
    }

    tokio::select! {
        output = work => Some(output),
        _ = abort.notified() => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataFormat;

    fn sample() -> SeriesResult {
        SeriesResult {
            data: vec![Some(1.0)],
            data_format: DataFormat::Scalar,
            from: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            point_duration_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_progress_then_resolve() {
        let (settlement, rx) = Settlement::channel();
        let mut handle = FetchHandle::new(RequestId(1), settlement.clone(), rx);

        assert!(settlement.notify(sample()));
        assert!(settlement.resolve(sample()));
        assert!(!settlement.reject(FetchError::IncompleteData));
        assert!(!settlement.notify(sample()));

        assert!(matches!(handle.next_event().await, Some(FetchEvent::Progress(_))));
        assert!(matches!(handle.next_event().await, Some(FetchEvent::Resolved(_))));
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_result_skips_progress() {
        let (settlement, rx) = Settlement::channel();
        let handle = FetchHandle::new(RequestId(1), settlement.clone(), rx);
        settlement.notify(sample());
        settlement.reject(FetchError::IncompleteData);
        assert_eq!(handle.result().await, Err(FetchError::IncompleteData));
    }

    #[test]
    fn test_on_settle_runs_once() {
        let (settlement, _rx) = Settlement::<SeriesResult>::channel();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        settlement.on_settle(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        settlement.reject(FetchError::IncompleteData);
        settlement.reject(FetchError::IncompleteData);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        settlement.on_settle(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropping_handle_cancels() {
        let (settlement, rx) = Settlement::<SeriesResult>::channel();
        let handle = FetchHandle::new(RequestId(7), settlement.clone(), rx);
        assert!(!settlement.is_settled());
        drop(handle);
        assert!(settlement.is_settled());
    }

    #[test]
    fn test_cancel_uses_user_reason() {
        let (settlement, rx) = Settlement::<SeriesResult>::channel();
        let mut handle = FetchHandle::new(RequestId(2), settlement, rx);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(
            handle.events.try_recv().ok(),
            Some(FetchEvent::Rejected(FetchError::cancelled_by_user()))
        );
    }

    #[tokio::test]
    async fn test_work_runs_while_someone_waits() {
        let (a, _rx_a) = Settlement::<u32>::channel();
        let (b, _rx_b) = Settlement::<u32>::channel();
        a.reject(FetchError::cancelled_by_user());
        let output = unless_all_settled([&a, &b], async { 5 }).await;
        assert_eq!(output, Some(5));
    }

    #[tokio::test]
    async fn test_work_dropped_once_everyone_settled() {
        let (a, _rx_a) = Settlement::<u32>::channel();
        let (b, _rx_b) = Settlement::<u32>::channel();
        let cancel = {
            let (a, b) = (a.clone(), b.clone());
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                a.reject(FetchError::cancelled_by_user());
                b.reject(FetchError::cancelled_by_user());
            }
        };
        let work = async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            1
        };
        let (output, _) = tokio::join!(unless_all_settled([&a, &b], work), cancel);
        assert_eq!(output, None);
    }
}
