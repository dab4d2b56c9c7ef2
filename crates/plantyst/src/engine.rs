//! Fetch engine: batches queued requests, serves them from the partition
//! cache, and fetches every remaining gap with a single server call per batch.
//!
//! One batch runs through these steps:
//!
//! 1. Turn queued requests into [`FetchItem`]s aligned to their point grid.
//! 2. Cut the missing ranges into cache partitions and load what is stored.
//! 3. Merge cached data into the items; resolve the complete ones and send
//!    the others a progress event.
//! 4. Coalesce incomplete partition tails and item gaps into server queries.
//! 5. Send one request. It is aborted once every item of the batch settled.
//! 6. Merge each answer into the partitions and items it was asked for, save
//!    the partitions, then resolve or reject whatever is left.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::bridge::BridgeRequest;
use crate::cache::ClearScope;
use crate::coalesce::{build_network_queries, Contributor, NetworkPlan};
use crate::context::{EngineConfig, SdkContext};
use crate::item::{FetchItem, MergeOutcome};
use crate::partition::{build_index, CachePartition};
use crate::promise::{unless_all_settled, FetchHandle, Settlement};
use crate::queue::{BatchFuture, BatchProcessor, QueueEntry, RequestQueue};
use crate::source::{AggregationSource, SeriesPlan, SeriesSource, ServerChunk, StateSumSource};
use crate::types::{FetchError, FetchResult, RequestId, SeriesChunk, SeriesQuery, SeriesResult};
use crate::wire::ServerRequest;

/// Engine over aggregated time series.
pub type AggregationEngine = FetchEngine<AggregationSource>;

/// Engine over daily machine-state sums.
pub type StateSumEngine = FetchEngine<StateSumSource>;

#[derive(Clone)]
struct QueuedFetch {
    id: RequestId,
    query: SeriesQuery,
    plan: SeriesPlan,
    settlement: Settlement,
}

impl QueueEntry for QueuedFetch {
    type Output = SeriesResult;

    fn request_id(&self) -> RequestId {
        self.id
    }

    fn settlement(&self) -> &Settlement {
        &self.settlement
    }
}

struct EngineInner<S: SeriesSource> {
    source: S,
    context: SdkContext,
    queue: RequestQueue<QueuedFetch>,
    next_id: AtomicU64,
}

/// Batched, cached series fetcher. Cheap to clone.
pub struct FetchEngine<S: SeriesSource> {
    inner: Arc<EngineInner<S>>,
}

impl<S: SeriesSource> Clone for FetchEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SeriesSource> FetchEngine<S> {
    pub fn new(source: S, context: SdkContext, config: EngineConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner<S>>| {
            let weak = weak.clone();
            let processor: BatchProcessor<QueuedFetch> = Arc::new(move |batch: Vec<QueuedFetch>| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => inner.process(batch).await,
                        None => {
                            for entry in batch {
                                entry
                                    .settlement
                                    .reject(FetchError::Cancelled("fetch engine dropped".into()));
                            }
                        }
                    }
                }) as BatchFuture
            });
            EngineInner {
                source,
                context,
                queue: RequestQueue::new(config.process_delay, processor),
                next_id: AtomicU64::new(1),
            }
        });
        Self { inner }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn context(&self) -> &SdkContext {
        &self.inner.context
    }

    /// Queue a query. It is processed together with every other query
    /// queued within the same `process_delay` window.
    ///
    /// Malformed queries fail immediately and never reach the queue.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn fetch(&self, query: SeriesQuery) -> FetchResult<FetchHandle> {
        if query.to <= query.from {
            return Err(FetchError::InvalidRange {
                from: query.from,
                to: query.to,
            });
        }
        let setup = self.inner.context.cache.setup();
        let plan = self.inner.source.plan(&query, &setup.local_storage_prefix)?;

        let id = RequestId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (settlement, events) = Settlement::channel();
        tracing::debug!(
            "Queued fetch {id} for measurement {} over {}",
            query.measurement_id,
            query.range()
        );
        self.inner.queue.push(QueuedFetch {
            id,
            query,
            plan,
            settlement: settlement.clone(),
        });
        Ok(FetchHandle::new(id, settlement, events))
    }

    /// Reject a waiting or in-flight fetch. Returns false if it already
    /// settled or was never issued by this engine.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.inner.queue.get(id) {
            Some(entry) => entry.settlement.reject(FetchError::cancelled_by_user()),
            None => false,
        }
    }
}

impl<S: SeriesSource> EngineInner<S> {
    async fn process(&self, batch: Vec<QueuedFetch>) {
        let cache = &self.context.cache;
        let mut items: Vec<FetchItem> = batch
            .into_iter()
            .filter(|entry| !entry.settlement.is_settled())
            .map(|entry| FetchItem::new(entry.query, entry.plan, entry.settlement))
            .collect();
        if items.is_empty() {
            return;
        }

        let mut partitions = build_index(&items, cache);
        self.apply_cached_data(&mut items, &partitions);
        resolve_items(&mut items, false);

        let pending: Vec<usize> = (0..items.len()).filter(|&i| !items[i].is_settled()).collect();
        if pending.is_empty() {
            tracing::debug!("Batch of {} served from cache", items.len());
            return;
        }

        let incomplete: Vec<usize> = if cache.setup().cache_writing_enabled {
            (0..partitions.len())
                .filter(|&i| partitions[i].is_incomplete())
                .collect()
        } else {
            Vec::new()
        };

        let plan = build_network_queries(&self.source, &partitions, &incomplete, &items, &pending);
        if plan.is_empty() {
            resolve_items(&mut items, true);
            return;
        }

        let Some(body) = self.request_server(&plan, &items, &pending).await else {
            return;
        };

        let chunks = match body.and_then(|body| self.source.parse_response(body)) {
            Ok(chunks) => chunks,
            Err(error) => {
                tracing::warn!("Fetch batch failed: {error}");
                for item in &items {
                    item.settlement.reject(error.clone());
                }
                return;
            }
        };

        self.apply_server_data(&chunks, &plan, &mut partitions, &mut items);
        for &i in &incomplete {
            partitions[i].save(cache);
        }
        resolve_items(&mut items, true);
    }

    /// Send the batch's queries. `None` means every pending item settled
    /// while the request was in flight and the request was dropped.
    async fn request_server(
        &self,
        plan: &NetworkPlan,
        items: &[FetchItem],
        pending: &[usize],
    ) -> Option<FetchResult<serde_json::Value>> {
        let body = match serde_json::to_value(ServerRequest {
            queries: &plan.queries,
        }) {
            Ok(body) => body,
            Err(e) => return Some(Err(FetchError::InvalidResponse(e.to_string()))),
        };
        let request = BridgeRequest::post(self.source.endpoint(), body)
            .with_claims(self.source.claims(&plan.queries));

        tracing::debug!(
            "Requesting {} queries from {}",
            plan.queries.len(),
            request.endpoint
        );
        let watched = pending.iter().map(|&i| &items[i].settlement);
        let response = unless_all_settled(watched, self.context.bridge.send(request)).await;
        if response.is_none() {
            tracing::debug!("Every request of the batch settled, aborting server call");
        }
        response.map(|r| r.map_err(|e| FetchError::Network(e.to_string())))
    }

    fn apply_cached_data(&self, items: &mut [FetchItem], partitions: &[CachePartition]) {
        for partition in partitions {
            let Some(loaded) = &partition.loaded else {
                continue;
            };
            for &i in &partition.items {
                self.merge_into_item(&mut items[i], loaded, partition.key_range.from);
                items[i].is_notified = false;
            }
        }
    }

    fn apply_server_data(
        &self,
        chunks: &[ServerChunk],
        plan: &NetworkPlan,
        partitions: &mut [CachePartition],
        items: &mut [FetchItem],
    ) {
        for server_chunk in chunks {
            let Some(route) = plan.routes.get(&server_chunk.identity) else {
                tracing::warn!("Ignoring unrequested result {}", server_chunk.identity);
                continue;
            };
            for contributor in route {
                match *contributor {
                    Contributor::Partition(i) => {
                        partitions[i].merge(&server_chunk.chunk, server_chunk.requested_from);
                    }
                    Contributor::Item(i) => {
                        self.merge_into_item(
                            &mut items[i],
                            &server_chunk.chunk,
                            server_chunk.requested_from,
                        );
                    }
                }
            }
        }
    }

    fn merge_into_item(&self, item: &mut FetchItem, chunk: &SeriesChunk, requested_from: i64) {
        if item.is_settled() {
            return;
        }
        match item.merge(chunk, requested_from) {
            MergeOutcome::Merged => {}
            MergeOutcome::NoOverlap => {
                tracing::debug!("Chunk {} does not overlap requested range", chunk.range);
            }
            MergeOutcome::FormatMismatch => {
                tracing::warn!(
                    "Incompatible data formats for measurement {}, clearing series cache",
                    item.query.measurement_id
                );
                self.context.cache.clear(ClearScope::SeriesData);
                item.settlement.reject(FetchError::DataFormatMismatch);
            }
        }
    }
}

/// Resolve complete items and report progress on the rest. The final pass
/// rejects whatever could not be completed.
fn resolve_items(items: &mut [FetchItem], final_pass: bool) {
    for item in items.iter_mut() {
        if item.is_settled() {
            continue;
        }
        if item.is_resolvable(final_pass) {
            item.settlement.resolve(item.result());
        } else if !item.is_notified {
            item.settlement.notify(item.result());
            item.is_notified = true;
        }
        if final_pass && !item.is_settled() {
            item.settlement.reject(FetchError::IncompleteData);
        }
    }
}
