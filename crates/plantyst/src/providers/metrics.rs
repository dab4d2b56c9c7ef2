//! Batched multi-query endpoints: measurement metrics and metric quotas.
//!
//! Queries queued together are deduplicated by identity and posted as one
//! `{"Queries": [...]}` request. Answers are matched back by the identity
//! of the query the server echoes.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{batching_queue, cancel_queued, enqueue, BatchHandler, Queued};
use crate::bridge::BridgeRequest;
use crate::context::{EngineConfig, SdkContext};
use crate::promise::{unless_all_settled, FetchHandle};
use crate::queue::RequestQueue;
use crate::types::{millis_to_datetime, FetchError, FetchResult, RequestId};
use crate::wire::{format_time, identity_time, parse_time};

/// A query type served by a multi-query endpoint.
pub trait MultiQuery: Clone + Send + Sync + 'static {
    type Output: Clone + Send + 'static;

    const ENDPOINT: &'static str;

    /// Pairs requests with answers and filters duplicates.
    fn identity(&self) -> String;

    fn server_query(&self) -> Value;

    /// Echoed queries and their answers.
    fn parse_results(response: &Value) -> FetchResult<Vec<(Self, Self::Output)>>;
}

/// Metrics of one measurement over a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsQuery {
    pub measurement_id: i64,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub maximum_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

/// Quota of one metric over a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaQuery {
    pub measurement_id: i64,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub metric_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Quota {
    pub total_quota: Option<f64>,
}

/// New quota value for a metric, starting at `from`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaUpdate {
    pub measurement_id: i64,
    pub from: DateTime<Utc>,
    pub timespan: String,
    pub metric_name: String,
    pub value: f64,
}

fn identity_prefix(measurement_id: i64, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    format!(
        "{measurement_id}.{}.{}",
        identity_time(from.timestamp_millis()),
        identity_time(to.timestamp_millis())
    )
}

fn echoed_time(raw: &str) -> Option<DateTime<Utc>> {
    parse_time(raw).map(millis_to_datetime)
}

#[derive(Deserialize)]
struct ResultList<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

fn result_list<T: DeserializeOwned>(response: &Value) -> FetchResult<Vec<T>> {
    serde_json::from_value::<ResultList<T>>(response.clone())
        .map(|list| list.results)
        .map_err(|e| FetchError::InvalidResponse(e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EchoedMetricsQuery {
    measurement_id: i64,
    from: String,
    to: String,
    maximum_count: u32,
}

#[derive(Deserialize)]
struct MetricsAnswer {
    query: EchoedMetricsQuery,
    #[serde(default)]
    results: Vec<Metric>,
}

impl MultiQuery for MetricsQuery {
    type Output = Vec<Metric>;

    const ENDPOINT: &'static str = "MeasurementMetricsQuery";

    fn identity(&self) -> String {
        format!(
            "{}.{}",
            identity_prefix(self.measurement_id, self.from, self.to),
            self.maximum_count
        )
    }

    fn server_query(&self) -> Value {
        json!({
            "measurementId": self.measurement_id,
            "from": format_time(self.from.timestamp_millis()),
            "to": format_time(self.to.timestamp_millis()),
            "maximumCount": self.maximum_count,
        })
    }

    fn parse_results(response: &Value) -> FetchResult<Vec<(Self, Self::Output)>> {
        let answers: Vec<MetricsAnswer> = result_list(response)?;
        Ok(answers
            .into_iter()
            .filter_map(|a| {
                let query = MetricsQuery {
                    measurement_id: a.query.measurement_id,
                    from: echoed_time(&a.query.from)?,
                    to: echoed_time(&a.query.to)?,
                    maximum_count: a.query.maximum_count,
                };
                Some((query, a.results))
            })
            .collect())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EchoedQuotaQuery {
    measurement_id: i64,
    from: String,
    to: String,
    metric_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotaResult {
    total_quota: Option<f64>,
}

#[derive(Deserialize)]
struct QuotaAnswer {
    query: EchoedQuotaQuery,
    result: QuotaResult,
}

impl MultiQuery for QuotaQuery {
    type Output = Quota;

    const ENDPOINT: &'static str = "MeasurementMetricQuotasQuery";

    fn identity(&self) -> String {
        format!(
            "{}.{}",
            identity_prefix(self.measurement_id, self.from, self.to),
            self.metric_name
        )
    }

    fn server_query(&self) -> Value {
        json!({
            "measurementId": self.measurement_id,
            "from": format_time(self.from.timestamp_millis()),
            "to": format_time(self.to.timestamp_millis()),
            "metricName": self.metric_name,
        })
    }

    fn parse_results(response: &Value) -> FetchResult<Vec<(Self, Self::Output)>> {
        let answers: Vec<QuotaAnswer> = result_list(response)?;
        Ok(answers
            .into_iter()
            .filter_map(|a| {
                let query = QuotaQuery {
                    measurement_id: a.query.measurement_id,
                    from: echoed_time(&a.query.from)?,
                    to: echoed_time(&a.query.to)?,
                    metric_name: a.query.metric_name,
                };
                Some((
                    query,
                    Quota {
                        total_quota: a.result.total_quota,
                    },
                ))
            })
            .collect())
    }
}

type Entry<Q> = Queued<Q, <Q as MultiQuery>::Output>;

struct MultiQueryInner<Q: MultiQuery> {
    context: SdkContext,
    queue: RequestQueue<Entry<Q>>,
    next_id: AtomicU64,
    _query: PhantomData<fn() -> Q>,
}

/// Batched client of one multi-query endpoint. Cheap to clone.
pub struct MultiQueryProvider<Q: MultiQuery> {
    inner: Arc<MultiQueryInner<Q>>,
}

pub type MetricsProvider = MultiQueryProvider<MetricsQuery>;
pub type QuotaProvider = MultiQueryProvider<QuotaQuery>;

impl<Q: MultiQuery> Clone for MultiQueryProvider<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Q: MultiQuery> MultiQueryProvider<Q> {
    pub fn new(context: SdkContext, config: EngineConfig) -> Self {
        let inner = Arc::new_cyclic(|weak| MultiQueryInner {
            context,
            queue: batching_queue(weak.clone(), config.process_delay),
            next_id: AtomicU64::new(1),
            _query: PhantomData,
        });
        Self { inner }
    }

    /// Queue a query for the next batch.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn fetch(&self, query: Q) -> FetchHandle<Q::Output> {
        tracing::debug!("Queued {} query {}", Q::ENDPOINT, query.identity());
        enqueue(&self.inner.queue, &self.inner.next_id, query)
    }

    pub fn cancel(&self, id: RequestId) -> bool {
        cancel_queued(&self.inner.queue, id)
    }
}

impl QuotaProvider {
    pub const SET_ENDPOINT: &'static str = "MeasurementMetricQuotas";

    /// Store a new quota. Not batched.
    pub async fn set_quota(&self, update: &QuotaUpdate) -> FetchResult<Value> {
        let body = json!({
            "measurementId": update.measurement_id,
            "from": format_time(update.from.timestamp_millis()),
            "timespan": update.timespan,
            "metricName": update.metric_name,
            "value": update.value,
        });
        self.inner
            .context
            .bridge
            .send(BridgeRequest::post(Self::SET_ENDPOINT, body))
            .await
            .map_err(|e| FetchError::Network(e.to_string()))
    }
}

#[async_trait]
impl<Q: MultiQuery> BatchHandler for MultiQueryInner<Q> {
    type Query = Q;
    type Output = Q::Output;

    async fn process(self: Arc<Self>, batch: Vec<Entry<Q>>) {
        let entries: Vec<Entry<Q>> = batch.into_iter().filter(|e| !e.settlement.is_settled()).collect();
        if entries.is_empty() {
            return;
        }

        let mut seen = HashSet::new();
        let queries: Vec<Value> = entries
            .iter()
            .filter(|e| seen.insert(e.query.identity()))
            .map(|e| e.query.server_query())
            .collect();
        tracing::debug!(
            "Requesting {} distinct queries from {} for {} fetches",
            queries.len(),
            Q::ENDPOINT,
            entries.len()
        );
        let request = BridgeRequest::post(Q::ENDPOINT, json!({ "Queries": queries }));

        let watched = entries.iter().map(|e| &e.settlement);
        let answers = match unless_all_settled(watched, self.context.bridge.send(request)).await {
            None => {
                tracing::debug!("Every {} fetch settled, aborting server call", Q::ENDPOINT);
                return;
            }
            Some(Ok(response)) => Q::parse_results(&response),
            Some(Err(e)) => Err(FetchError::Network(e.to_string())),
        };

        let answers: HashMap<String, Q::Output> = match answers {
            Ok(answers) => answers.into_iter().map(|(q, out)| (q.identity(), out)).collect(),
            Err(e) => {
                tracing::warn!("{} request failed: {e}", Q::ENDPOINT);
                for entry in &entries {
                    entry.settlement.reject(e.clone());
                }
                return;
            }
        };
        for entry in &entries {
            match answers.get(&entry.query.identity()) {
                Some(output) => entry.settlement.resolve(output.clone()),
                None => entry.settlement.reject(FetchError::MissingResult),
            };
        }
    }
}
