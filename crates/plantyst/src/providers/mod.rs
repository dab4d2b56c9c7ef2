//! Metadata providers: downtime codes, subscriptions, measurement listings,
//! and metric multi-queries.
//!
//! They share the engine's building blocks ([`RequestQueue`], [`Settlement`],
//! [`KeyValueCache`](crate::cache::KeyValueCache)) but cache whole documents
//! with a fetch time instead of time partitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::promise::{FetchHandle, Settlement};
use crate::queue::{BatchFuture, BatchProcessor, QueueEntry, RequestQueue};
use crate::types::{FetchError, RequestId};

pub mod downtime;
pub mod hal;
pub mod measurements;
pub mod metrics;
pub mod subscriptions;

pub use downtime::{sort_downtime_codes, DowntimeCode, DowntimeCodesProvider};
pub use measurements::{DataVersion, Measurement, MeasurementProvider, Tag, TimeZoneInfo};
pub use metrics::{
    Metric, MetricsProvider, MetricsQuery, MultiQuery, MultiQueryProvider, Quota, QuotaProvider,
    QuotaQuery, QuotaUpdate,
};
pub use subscriptions::{Feature, Subscription, SubscriptionProvider, Subscriptions};

/// A queued provider request.
pub(crate) struct Queued<Q, T> {
    pub id: RequestId,
    pub query: Q,
    pub settlement: Settlement<T>,
}

impl<Q: Clone, T> Clone for Queued<Q, T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            query: self.query.clone(),
            settlement: self.settlement.clone(),
        }
    }
}

impl<Q, T> QueueEntry for Queued<Q, T>
where
    Q: Clone + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn request_id(&self) -> RequestId {
        self.id
    }

    fn settlement(&self) -> &Settlement<T> {
        &self.settlement
    }
}

/// Provider state that processes flushed batches.
#[async_trait]
pub(crate) trait BatchHandler: Send + Sync + 'static {
    type Query: Clone + Send + 'static;
    type Output: Send + 'static;

    async fn process(self: Arc<Self>, batch: Vec<Queued<Self::Query, Self::Output>>);
}

type HandlerEntry<H> = Queued<<H as BatchHandler>::Query, <H as BatchHandler>::Output>;

/// Queue whose flushes go to `handler` while it is alive.
pub(crate) fn batching_queue<H: BatchHandler>(
    handler: Weak<H>,
    delay: Duration,
) -> RequestQueue<HandlerEntry<H>> {
    let processor: BatchProcessor<HandlerEntry<H>> = Arc::new(move |batch: Vec<HandlerEntry<H>>| {
        let handler = handler.clone();
        Box::pin(async move {
            match handler.upgrade() {
                Some(handler) => handler.process(batch).await,
                None => {
                    for entry in batch {
                        entry
                            .settlement
                            .reject(FetchError::Cancelled("provider dropped".into()));
                    }
                }
            }
        }) as BatchFuture
    });
    RequestQueue::new(delay, processor)
}

/// Push a query and hand back the caller's side of it.
pub(crate) fn enqueue<Q, T>(
    queue: &RequestQueue<Queued<Q, T>>,
    next_id: &AtomicU64,
    query: Q,
) -> FetchHandle<T>
where
    Q: Clone + Send + 'static,
    T: Send + 'static,
{
    let id = RequestId(next_id.fetch_add(1, Ordering::Relaxed));
    let (settlement, events) = Settlement::channel();
    queue.push(Queued {
        id,
        query,
        settlement: settlement.clone(),
    });
    FetchHandle::new(id, settlement, events)
}

/// Reject a queued request by id.
pub(crate) fn cancel_queued<Q, T>(queue: &RequestQueue<Queued<Q, T>>, id: RequestId) -> bool
where
    Q: Clone + Send + 'static,
    T: Send + 'static,
{
    match queue.get(id) {
        Some(entry) => entry.settlement.reject(FetchError::cancelled_by_user()),
        None => false,
    }
}
