//! HAL+JSON response helpers (`_embedded` resources, `_links` relations).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::types::{millis_to_datetime, FetchError, FetchResult};
use crate::wire::parse_time;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Link {
    pub href: String,
}

/// A relation holding either one link or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item).iter(),
            OneOrMany::Many(items) => items.iter(),
        }
    }
}

/// `_links` of a resource, by relation name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Links(HashMap<String, OneOrMany<Link>>);

impl Links {
    /// Every href of a relation, in document order.
    pub fn hrefs(&self, rel: &str) -> Vec<&str> {
        self.0
            .get(rel)
            .map(|links| links.iter().map(|l| l.href.as_str()).collect())
            .unwrap_or_default()
    }

    /// First href of a relation.
    pub fn href(&self, rel: &str) -> Option<&str> {
        self.0
            .get(rel)
            .and_then(|links| links.iter().next())
            .map(|l| l.href.as_str())
    }

    pub fn self_href(&self) -> Option<&str> {
        self.href("self")
    }
}

/// Decode `_embedded.<name>` as a list. Absent lists are empty.
pub fn embedded<T: DeserializeOwned>(response: &Value, name: &str) -> FetchResult<Vec<T>> {
    match response.get("_embedded").and_then(|e| e.get(name)) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(list) => serde_json::from_value(list.clone())
            .map_err(|e| FetchError::InvalidResponse(format!("_embedded.{name}: {e}"))),
    }
}

/// Decode the top-level `_links` of a response.
pub fn links(response: &Value) -> Links {
    response
        .get("_links")
        .cloned()
        .and_then(|links| serde_json::from_value(links).ok())
        .unwrap_or_default()
}

/// Scalars the API sends either as strings or as numbers, kept as text.
pub fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// ISO 8601 timestamp, `None` when absent or unparsable.
pub fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_time).map(millis_to_datetime)
}
