//! Series sources: the per-endpoint strategy the fetch engine is generic over.
//!
//! A source decides how queries map to cache partitions, how coalesced ranges
//! are phrased as server queries, and how server responses become chunks.

use serde_json::{Map, Value};

use crate::bridge::Claims;
use crate::types::{DataFormat, FetchError, FetchResult, SeriesChunk, SeriesQuery, TimeRange};
use crate::view::{PartitionUnit, ViewCatalog};
use crate::wire::{
    format_time, identity_time, parse_time, AggregationResponse, ServerQuery, StateSumResponse,
};

const DAY_MS: i64 = 86_400_000;

/// How one query is sampled and cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesPlan {
    pub view: Option<String>,
    pub point_duration: i64,
    pub partition: PartitionUnit,
    /// Store key prefix shared by every partition of this series.
    pub cache_key_base: String,
}

/// A parsed server result, tagged with the identity of the query it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerChunk {
    pub identity: String,
    pub requested_from: i64,
    pub chunk: SeriesChunk,
}

/// Endpoint-specific behaviour plugged into the fetch engine.
pub trait SeriesSource: Send + Sync + 'static {
    /// API endpoint, relative to the base URL.
    fn endpoint(&self) -> &str;

    /// Cache namespace, e.g. `MTSA.`.
    fn cache_prefix(&self) -> &str;

    /// Resolve sampling and caching for a query. Rejects unknown views.
    fn plan(&self, query: &SeriesQuery, storage_prefix: &str) -> FetchResult<SeriesPlan>;

    /// Key pairing a server query with its result.
    fn query_identity(&self, measurement_id: i64, view: Option<&str>, range: TimeRange) -> String;

    fn server_query(&self, measurement_id: i64, view: Option<&str>, range: TimeRange)
        -> ServerQuery;

    /// Extra claims for the request's auth token.
    fn claims(&self, _queries: &[ServerQuery]) -> Option<Claims> {
        None
    }

    fn parse_response(&self, body: Value) -> FetchResult<Vec<ServerChunk>>;
}

/// Aggregated time series (`MeasurementTimeSeriesAggregationsQuery`).
#[derive(Debug, Clone)]
pub struct AggregationSource {
    views: ViewCatalog,
    endpoint: String,
}

impl Default for AggregationSource {
    fn default() -> Self {
        Self::new(ViewCatalog::standard())
    }
}

impl AggregationSource {
    pub const ENDPOINT: &'static str = "MeasurementTimeSeriesAggregationsQuery";

    pub fn new(views: ViewCatalog) -> Self {
        Self {
            views,
            endpoint: Self::ENDPOINT.to_string(),
        }
    }

    /// Post to a differently named endpoint speaking the same protocol.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn views(&self) -> &ViewCatalog {
        &self.views
    }
}

impl SeriesSource for AggregationSource {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn cache_prefix(&self) -> &str {
        "MTSA."
    }

    fn plan(&self, query: &SeriesQuery, storage_prefix: &str) -> FetchResult<SeriesPlan> {
        let id = query.view.as_deref().unwrap_or_default();
        let view = self
            .views
            .get(id)
            .ok_or_else(|| FetchError::UnknownView(id.to_string()))?;
        Ok(SeriesPlan {
            view: Some(view.id.clone()),
            point_duration: view.point_duration_ms,
            partition: view.partition,
            cache_key_base: format!(
                "{storage_prefix}{}{}.{}.",
                self.cache_prefix(),
                query.measurement_id,
                view.cache_key_name
            ),
        })
    }

    fn query_identity(&self, measurement_id: i64, view: Option<&str>, range: TimeRange) -> String {
        format!(
            "{measurement_id}.{}.{}.{}",
            view.unwrap_or_default(),
            identity_time(range.from),
            identity_time(range.to)
        )
    }

    fn server_query(
        &self,
        measurement_id: i64,
        view: Option<&str>,
        range: TimeRange,
    ) -> ServerQuery {
        ServerQuery {
            measurement_id,
            from: format_time(range.from),
            to: format_time(range.to),
            view: view.map(str::to_string),
        }
    }

    fn parse_response(&self, body: Value) -> FetchResult<Vec<ServerChunk>> {
        let response: AggregationResponse = serde_json::from_value(body)
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

        let mut chunks = Vec::with_capacity(response.results.len());
        for result in response.results {
            let query = &result.query;
            let (Some(from), Some(to)) = (parse_time(&query.from), parse_time(&query.to)) else {
                tracing::warn!("Skipping result with unreadable query range {query:?}");
                continue;
            };
            let view_id = query.view.as_deref().unwrap_or_default();
            let Some(view) = self.views.get(view_id) else {
                tracing::warn!("Skipping result for unknown view {view_id}");
                continue;
            };

            let format = DataFormat::from(result.output_format);
            let first = result
                .first
                .as_deref()
                .and_then(parse_time)
                .unwrap_or(from);
            let points = (result.data.len() / format.point_size()) as i64;

            chunks.push(ServerChunk {
                identity: self.query_identity(
                    query.measurement_id,
                    Some(view_id),
                    TimeRange::new(from, to),
                ),
                requested_from: from,
                chunk: SeriesChunk {
                    data: result.data,
                    format,
                    range: TimeRange::new(first, first + points * view.point_duration_ms),
                },
            });
        }
        Ok(chunks)
    }
}

/// Which state-sum endpoint a [`StateSumSource`] reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSumKind {
    /// Minutes spent in each machine state per day.
    TimeSums,
    /// Pulses counted in each machine state per day.
    ValueSums,
}

/// Daily machine-state sums (`MeasurementState{Time,Value}SumsQuery`).
#[derive(Debug, Clone)]
pub struct StateSumSource {
    kind: StateSumKind,
    fields: Vec<String>,
}

impl StateSumSource {
    pub fn new(kind: StateSumKind) -> Self {
        let fields: &[&str] = match kind {
            StateSumKind::TimeSums => &["uptime", "setup", "stop", "noData"],
            StateSumKind::ValueSums => &["uptime", "setup"],
        };
        Self {
            kind,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn time_sums() -> Self {
        Self::new(StateSumKind::TimeSums)
    }

    pub fn value_sums() -> Self {
        Self::new(StateSumKind::ValueSums)
    }

    pub fn kind(&self) -> StateSumKind {
        self.kind
    }

    /// Flatten daily rows onto a fixed grid starting at the first row.
    ///
    /// Row times are floored to UTC midnight. Rows outside `requested` are
    /// dropped, so the grid never outgrows the query.
    fn flatten(&self, rows: &[Map<String, Value>], requested: TimeRange) -> Option<SeriesChunk> {
        let window = TimeRange::new(requested.from.div_euclid(DAY_MS) * DAY_MS, requested.to);
        let timed: Vec<(i64, &Map<String, Value>)> = rows
            .iter()
            .filter_map(|row| {
                let Some(time) = row.get("time").and_then(Value::as_str).and_then(parse_time) else {
                    tracing::warn!("Skipping state-sum row without a readable time");
                    return None;
                };
                let day = time.div_euclid(DAY_MS) * DAY_MS;
                if day < window.from || day >= window.to {
                    tracing::warn!("Skipping state-sum row outside {requested}");
                    return None;
                }
                Some((day, row))
            })
            .collect();

        let first = timed.iter().map(|(t, _)| *t).min()?;
        let last = timed.iter().map(|(t, _)| *t).max()?;
        let size = self.fields.len();
        let points = ((last - first) / DAY_MS + 1) as usize;

        let mut data = vec![None; points * size];
        for (day, row) in timed {
            let base = ((day - first) / DAY_MS) as usize * size;
            for (offset, field) in self.fields.iter().enumerate() {
                data[base + offset] = row.get(field).and_then(Value::as_f64);
            }
        }

        Some(SeriesChunk {
            data,
            format: DataFormat::Fields(self.fields.clone()),
            range: TimeRange::new(first, first + points as i64 * DAY_MS),
        })
    }
}

impl SeriesSource for StateSumSource {
    fn endpoint(&self) -> &str {
        match self.kind {
            StateSumKind::TimeSums => "MeasurementStateTimeSumsQuery",
            StateSumKind::ValueSums => "MeasurementStateValueSumsQuery",
        }
    }

    fn cache_prefix(&self) -> &str {
        match self.kind {
            StateSumKind::TimeSums => "MSTS.",
            StateSumKind::ValueSums => "MSVS.",
        }
    }

    fn plan(&self, query: &SeriesQuery, storage_prefix: &str) -> FetchResult<SeriesPlan> {
        Ok(SeriesPlan {
            view: None,
            point_duration: DAY_MS,
            partition: PartitionUnit::Year,
            cache_key_base: format!(
                "{storage_prefix}{}{}.",
                self.cache_prefix(),
                query.measurement_id
            ),
        })
    }

    fn query_identity(&self, measurement_id: i64, _view: Option<&str>, range: TimeRange) -> String {
        format!(
            "{measurement_id}.{}.{}",
            identity_time(range.from),
            identity_time(range.to)
        )
    }

    fn server_query(
        &self,
        measurement_id: i64,
        _view: Option<&str>,
        range: TimeRange,
    ) -> ServerQuery {
        ServerQuery {
            measurement_id,
            from: format_time(range.from),
            to: format_time(range.to),
            view: None,
        }
    }

    fn claims(&self, queries: &[ServerQuery]) -> Option<Claims> {
        let ids: Vec<String> = queries.iter().map(|q| q.measurement_id.to_string()).collect();
        let mut claims = Claims::new();
        claims.insert(
            "variableId".to_string(),
            Value::String(format!("[{}]", ids.join(","))),
        );
        Some(claims)
    }

    fn parse_response(&self, body: Value) -> FetchResult<Vec<ServerChunk>> {
        if body.is_null() {
            return Ok(Vec::new());
        }
        let response: StateSumResponse = serde_json::from_value(body)
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

        let mut chunks = Vec::new();
        for result in response.results {
            let query = &result.query;
            let (Some(from), Some(to)) = (parse_time(&query.from), parse_time(&query.to)) else {
                tracing::warn!("Skipping result with unreadable query range {query:?}");
                continue;
            };
            let requested = TimeRange::new(from, to);
            let Some(chunk) = result
                .result
                .as_deref()
                .and_then(|rows| self.flatten(rows, requested))
            else {
                continue;
            };
            chunks.push(ServerChunk {
                identity: self.query_identity(query.measurement_id, None, requested),
                requested_from: from,
                chunk,
            });
        }
        Ok(chunks)
    }
}
