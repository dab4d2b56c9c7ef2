//! JSON shapes exchanged with the measurement API.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::millis_to_datetime;

/// Timestamp format of query bounds on the wire.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Timestamp format inside query identities.
pub const IDENTITY_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

pub fn format_time(ms: i64) -> String {
    millis_to_datetime(ms).format(WIRE_TIME_FORMAT).to_string()
}

pub fn identity_time(ms: i64) -> String {
    millis_to_datetime(ms).format(IDENTITY_TIME_FORMAT).to_string()
}

/// Parse a server timestamp into epoch milliseconds.
///
/// Accepts RFC 3339 and zone-less `YYYY-MM-DDTHH:mm:ss[.fff]`, read as UTC.
pub fn parse_time(raw: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// One coalesced query as sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerQuery {
    pub measurement_id: i64,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
}

/// Request body: `{"Queries": [...]}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerRequest<'a> {
    pub queries: &'a [ServerQuery],
}

#[derive(Debug, Deserialize)]
pub struct AggregationResponse {
    #[serde(default)]
    pub results: Vec<AggregationResult>,
}

/// One aggregation result. `first` defaults to the query's `from`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    pub query: ServerQuery,
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default)]
    pub data: Vec<Option<f64>>,
    #[serde(default)]
    pub output_format: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct StateSumResponse {
    #[serde(default)]
    pub results: Vec<StateSumResult>,
}

/// One state-sum result: daily rows of `{time, <field>...}`.
#[derive(Debug, Deserialize)]
pub struct StateSumResult {
    pub query: ServerQuery,
    #[serde(default)]
    pub result: Option<Vec<Map<String, Value>>>,
}
