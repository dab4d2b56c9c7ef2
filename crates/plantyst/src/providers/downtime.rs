//! Downtime code dictionaries per measurement and culture.
//!
//! Dictionaries are cached per measurement under `downtimeCodes.<id>`, one
//! entry per culture with its fetch time, and trusted for
//! [`DEFAULT_EXPIRY_DAYS`]. Misses are fetched with one `DowntimeDictionary`
//! call per culture and batch.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::hal::{self, Links};
use super::{batching_queue, cancel_queued, enqueue, BatchHandler, Queued};
use crate::bridge::BridgeRequest;
use crate::context::{EngineConfig, SdkContext};
use crate::promise::{unless_all_settled, FetchHandle};
use crate::queue::RequestQueue;
use crate::types::{FetchError, FetchResult, RequestId};

pub const ENDPOINT: &str = "DowntimeDictionary";

/// How long a cached dictionary is served without asking the server.
pub const DEFAULT_EXPIRY_DAYS: i64 = 10;

/// One downtime code as shown to users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DowntimeCode {
    pub code: String,
    pub title: String,
    pub description: Option<String>,
    pub order: Option<f64>,
    pub severity: Option<i64>,
    pub valid_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DowntimeQuery {
    measurement_id: i64,
    culture: String,
}

type Entry = Queued<DowntimeQuery, Vec<DowntimeCode>>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CultureEntry {
    downtime_codes: Vec<DowntimeCode>,
    fetch_time: DateTime<Utc>,
}

struct DowntimeInner {
    context: SdkContext,
    expiry: chrono::Duration,
    queue: RequestQueue<Entry>,
    next_id: AtomicU64,
}

/// Batched, cached downtime code lookups. Cheap to clone.
#[derive(Clone)]
pub struct DowntimeCodesProvider {
    inner: Arc<DowntimeInner>,
}

impl DowntimeCodesProvider {
    pub fn new(context: SdkContext, config: EngineConfig) -> Self {
        Self::with_expiry(context, config, chrono::Duration::days(DEFAULT_EXPIRY_DAYS))
    }

    pub fn with_expiry(context: SdkContext, config: EngineConfig, expiry: chrono::Duration) -> Self {
        let inner = Arc::new_cyclic(|weak| DowntimeInner {
            context,
            expiry,
            queue: batching_queue(weak.clone(), config.process_delay),
            next_id: AtomicU64::new(1),
        });
        Self { inner }
    }

    /// Downtime codes configured for a measurement, titled in `culture`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn fetch(&self, measurement_id: i64, culture: impl Into<String>) -> FetchHandle<Vec<DowntimeCode>> {
        let query = DowntimeQuery {
            measurement_id,
            culture: culture.into(),
        };
        tracing::debug!("Queued downtime codes of {} ({})", query.measurement_id, query.culture);
        enqueue(&self.inner.queue, &self.inner.next_id, query)
    }

    pub fn cancel(&self, id: RequestId) -> bool {
        cancel_queued(&self.inner.queue, id)
    }
}

#[async_trait]
impl BatchHandler for DowntimeInner {
    type Query = DowntimeQuery;
    type Output = Vec<DowntimeCode>;

    async fn process(self: Arc<Self>, batch: Vec<Entry>) {
        let mut by_culture: BTreeMap<String, Vec<Entry>> = BTreeMap::new();
        for entry in batch {
            if entry.settlement.is_settled() {
                continue;
            }
            match self.cached(&entry.query) {
                Some(codes) => {
                    entry.settlement.resolve(codes);
                }
                None => by_culture.entry(entry.query.culture.clone()).or_default().push(entry),
            }
        }

        let mut requests = tokio::task::JoinSet::new();
        for (culture, entries) in by_culture {
            let inner = self.clone();
            requests.spawn(async move { inner.fetch_culture(culture, entries).await });
        }
        while requests.join_next().await.is_some() {}
    }
}

impl DowntimeInner {
    fn key(&self, measurement_id: i64) -> String {
        self.context.cache.key(&format!("downtimeCodes.{measurement_id}"))
    }

    fn cached(&self, query: &DowntimeQuery) -> Option<Vec<DowntimeCode>> {
        let mut cultures: HashMap<String, CultureEntry> =
            self.context.cache.get_json(&self.key(query.measurement_id))?;
        let entry = cultures.remove(&query.culture)?;
        if entry.fetch_time + self.expiry < self.context.clock.now() {
            tracing::debug!("Cached downtime codes of {} expired", query.measurement_id);
            return None;
        }
        Some(entry.downtime_codes)
    }

    fn save(&self, measurement_id: i64, culture: &str, codes: &[DowntimeCode]) {
        let cache = &self.context.cache;
        if !cache.setup().cache_writing_enabled {
            return;
        }
        let key = self.key(measurement_id);
        let mut cultures: HashMap<String, CultureEntry> = cache.get_json(&key).unwrap_or_default();
        cultures.insert(
            culture.to_string(),
            CultureEntry {
                downtime_codes: codes.to_vec(),
                fetch_time: self.context.clock.now(),
            },
        );
        cache.put_json(&key, &cultures);
    }

    async fn fetch_culture(&self, culture: String, entries: Vec<Entry>) {
        let mut ids: Vec<i64> = Vec::new();
        for entry in &entries {
            if !ids.contains(&entry.query.measurement_id) {
                ids.push(entry.query.measurement_id);
            }
        }
        let request = ids
            .iter()
            .fold(BridgeRequest::get(ENDPOINT), |request, id| {
                request.param("ids[]", id.to_string())
            })
            .param("culture", culture.as_str());

        let watched = entries.iter().map(|e| &e.settlement);
        let parsed = match unless_all_settled(watched, self.context.bridge.send(request)).await {
            None => {
                tracing::debug!("Every downtime code request for {culture} settled, aborting");
                return;
            }
            Some(Ok(response)) => parse_dictionary(&response),
            Some(Err(e)) => Err(FetchError::Network(e.to_string())),
        };

        let mut codes = match parsed {
            Ok(codes) => codes,
            Err(e) => {
                tracing::warn!("Downtime codes for {culture} failed: {e}");
                for entry in &entries {
                    entry.settlement.reject(e.clone());
                }
                return;
            }
        };

        for id in ids {
            let list = codes.remove(&id).unwrap_or_default();
            self.save(id, &culture, &list);
            for entry in entries.iter().filter(|e| e.query.measurement_id == id) {
                entry.settlement.resolve(list.clone());
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDowntimeCode {
    #[serde(default)]
    key: Value,
    #[serde(default)]
    code: Value,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    order: Option<f64>,
    #[serde(default)]
    severity: Option<i64>,
    #[serde(default)]
    valid_to: Option<String>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMeasurementCodes {
    measurement_id: i64,
    #[serde(rename = "_links", default)]
    links: Links,
}

/// Downtime codes per measurement from a `DowntimeDictionary` response.
///
/// Codes are shared resources linked from each measurement by href. Links
/// to codes the response does not embed are skipped.
fn parse_dictionary(response: &Value) -> FetchResult<HashMap<i64, Vec<DowntimeCode>>> {
    let codes: Vec<RawDowntimeCode> = hal::embedded(response, "downtimeCode")?;
    let by_href: HashMap<&str, DowntimeCode> = codes
        .iter()
        .filter_map(|raw| {
            let href = raw.links.self_href()?;
            let code = DowntimeCode {
                code: hal::text(&raw.key).unwrap_or_default(),
                title: hal::text(&raw.code).unwrap_or_default(),
                description: raw.title.clone(),
                order: raw.order,
                severity: raw.severity,
                valid_to: raw.valid_to.clone(),
            };
            Some((href, code))
        })
        .collect();

    let measurements: Vec<RawMeasurementCodes> = hal::embedded(response, "measurementDowntimeCode")?;
    Ok(measurements
        .into_iter()
        .map(|m| {
            let list = m
                .links
                .hrefs("downtimeCode")
                .into_iter()
                .filter_map(|href| by_href.get(href).cloned())
                .collect();
            (m.measurement_id, list)
        })
        .collect())
}

/// Display order: codes with an explicit order first, then codes shaped
/// like `<letters><digits>` by prefix and number, then the rest by code.
pub fn sort_downtime_codes(codes: &mut [DowntimeCode]) {
    codes.sort_by(compare);
}

fn compare(a: &DowntimeCode, b: &DowntimeCode) -> Ordering {
    match (a.order, b.order) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => match (letters_digits(&a.code), letters_digits(&b.code)) {
            (Some((pa, na)), Some((pb, nb))) => pa.cmp(pb).then_with(|| compare_digits(na, nb)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.code.cmp(&b.code),
        },
    }
}

/// Split `AB12` into `("AB", "12")`. `None` unless the code is ASCII
/// letters followed by at least one digit.
fn letters_digits(code: &str) -> Option<(&str, &str)> {
    let split = code.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(code.len());
    let (letters, digits) = code.split_at(split);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((letters, digits))
}

/// Numeric comparison of digit strings of any length.
fn compare_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
