//! Measurement listings with their time zones, tags, and data versions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::hal::{self, Links};
use crate::bridge::BridgeRequest;
use crate::context::SdkContext;
use crate::promise::{unless_all_settled, FetchHandle, Settlement};
use crate::types::{FetchError, FetchResult, RequestId};

pub const ENDPOINT: &str = "Measurements";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimeZoneInfo {
    pub id: Value,
    pub name: Option<String>,
    pub iana_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub id: Value,
    pub title: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataVersion {
    pub title: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Measurement {
    pub measurement_id: i64,
    pub title: Option<String>,
    pub time_zone: Option<TimeZoneInfo>,
    pub access_rights: Value,
    pub quantity_type: Value,
    pub tags: Option<Vec<Tag>>,
    pub first: Option<String>,
    pub description: Option<String>,
    pub data_versions: Option<Vec<DataVersion>>,
}

/// Measurement listings, cached per user. Cheap to clone.
#[derive(Clone)]
pub struct MeasurementProvider {
    context: SdkContext,
    next_id: Arc<AtomicU64>,
}

impl MeasurementProvider {
    pub fn new(context: SdkContext) -> Self {
        Self {
            context,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Measurements visible to `user_id`.
    ///
    /// A cached listing arrives first as progress. The server is always
    /// asked and its answer resolves the handle.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn fetch(&self, user_id: &str) -> FetchHandle<Vec<Measurement>> {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (settlement, events) = Settlement::channel();
        let key = self.context.cache.key(&format!("measurements.{user_id}"));

        if let Some(cached) = self.context.cache.get_json::<Vec<Measurement>>(&key) {
            settlement.notify(cached);
        }
        tokio::spawn(self.clone().fetch_from_server(key, settlement.clone()));
        FetchHandle::new(id, settlement, events)
    }

    async fn fetch_from_server(self, key: String, settlement: Settlement<Vec<Measurement>>) {
        let request = BridgeRequest::get(ENDPOINT);
        let parsed = match unless_all_settled([&settlement], self.context.bridge.send(request)).await {
            None => return,
            Some(Ok(response)) => parse_measurements(&response),
            Some(Err(e)) => Err(FetchError::Network(e.to_string())),
        };
        match parsed {
            Ok(measurements) => {
                self.context.cache.put_json(&key, &measurements);
                settlement.resolve(measurements);
            }
            Err(e) => {
                tracing::warn!("Measurements request failed: {e}");
                settlement.reject(e);
            }
        }
    }
}

#[derive(Deserialize)]
struct RawTimeZone {
    #[serde(default)]
    id: Value,
    name: Option<String>,
    iana: Option<String>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Deserialize)]
struct RawTag {
    #[serde(default)]
    id: Value,
    title: Option<String>,
    color: Option<String>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDataVersion {
    title: Option<String>,
    last_modified: Option<String>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMeasurement {
    measurement_id: i64,
    title: Option<String>,
    #[serde(default)]
    rights: Value,
    #[serde(default)]
    quantity_type: Value,
    first: Option<String>,
    description: Option<String>,
    #[serde(rename = "_links", default)]
    links: Links,
}

/// Index embedded resources by their self link.
fn by_self_href<R, T>(resources: Vec<R>, links: impl Fn(&R) -> &Links, map: impl Fn(R) -> T) -> HashMap<String, T> {
    resources
        .into_iter()
        .filter_map(|r| {
            let href = links(&r).self_href()?.to_string();
            Some((href, map(r)))
        })
        .collect()
}

/// Resolve a relation against an index. Absent relations stay `None`.
fn linked<T: Clone>(links: &Links, rel: &str, index: &HashMap<String, T>) -> Option<Vec<T>> {
    let hrefs = links.hrefs(rel);
    if hrefs.is_empty() {
        return None;
    }
    Some(hrefs.into_iter().filter_map(|h| index.get(h).cloned()).collect())
}

fn parse_measurements(response: &Value) -> FetchResult<Vec<Measurement>> {
    let zones = by_self_href(
        hal::embedded::<RawTimeZone>(response, "timezone")?,
        |z| &z.links,
        |z| TimeZoneInfo {
            id: z.id,
            name: z.name,
            iana_name: z.iana,
        },
    );
    let tags = by_self_href(
        hal::embedded::<RawTag>(response, "tag")?,
        |t| &t.links,
        |t| Tag {
            id: t.id,
            title: t.title,
            color: t.color,
        },
    );
    let versions = by_self_href(
        hal::embedded::<RawDataVersion>(response, "measurementDataVersion")?,
        |v| &v.links,
        |v| DataVersion {
            title: v.title,
            last_modified: v.last_modified,
        },
    );

    let measurements: Vec<RawMeasurement> = hal::embedded(response, "measurement")?;
    Ok(measurements
        .into_iter()
        .map(|m| Measurement {
            measurement_id: m.measurement_id,
            title: m.title,
            time_zone: m.links.href("timezone").and_then(|h| zones.get(h).cloned()),
            access_rights: m.rights,
            quantity_type: m.quantity_type,
            tags: linked(&m.links, "tags", &tags),
            first: m.first,
            description: m.description,
            data_versions: linked(&m.links, "dataVersions", &versions),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_resolves_links() {
        let response = json!({"_embedded": {
            "timezone": [{"id": 1, "name": "CET", "iana": "Europe/Prague",
                          "_links": {"self": {"href": "/tz/1"}}}],
            "tag": [
                {"id": 4, "title": "Line A", "color": "#f00", "_links": {"self": {"href": "/tag/4"}}},
                {"id": 5, "title": "Line B", "_links": {"self": {"href": "/tag/5"}}}
            ],
            "measurementDataVersion": [{"title": "v2", "lastModified": "2020-01-01T00:00:00Z",
                                        "_links": {"self": {"href": "/dv/2"}}}],
            "measurement": [
                {"measurementId": 10, "title": "Press", "rights": ["read"], "quantityType": "count",
                 "first": "2019-05-01T00:00:00Z",
                 "_links": {"timezone": {"href": "/tz/1"},
                            "tags": [{"href": "/tag/5"}, {"href": "/tag/4"}],
                            "dataVersions": {"href": "/dv/2"}}},
                {"measurementId": 11, "_links": {"timezone": {"href": "/tz/9"}}}
            ]
        }});
        let parsed = parse_measurements(&response).unwrap();
        assert_eq!(parsed.len(), 2);

        let press = &parsed[0];
        assert_eq!(press.measurement_id, 10);
        assert_eq!(press.time_zone.as_ref().and_then(|z| z.iana_name.as_deref()), Some("Europe/Prague"));
        let tags: Vec<_> = press.tags.iter().flatten().map(|t| t.title.as_deref()).collect();
        assert_eq!(tags, vec![Some("Line B"), Some("Line A")]);
        assert_eq!(press.data_versions.as_ref().map(Vec::len), Some(1));
        assert_eq!(press.access_rights, json!(["read"]));

        let bare = &parsed[1];
        assert_eq!(bare.time_zone, None);
        assert_eq!(bare.tags, None);
        assert_eq!(bare.data_versions, None);
    }

    #[test]
    fn test_cached_layout() {
        let parsed = parse_measurements(&json!({"_embedded": {"measurement": [
            {"measurementId": 3, "title": "Oven"}
        ]}}))
        .unwrap();
        let value = serde_json::to_value(&parsed).unwrap();
        assert_eq!(value[0]["MeasurementId"], json!(3));
        assert_eq!(value[0]["Title"], json!("Oven"));
        assert_eq!(value[0]["TimeZone"], json!(null));
    }
}
