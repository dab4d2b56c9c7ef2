//! Best-effort series cache on top of a [`KeyValueStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::store::{KeyValueStore, MemoryStore};

/// Namespaces holding cached series data, relative to the storage prefix.
pub const SERIES_NAMESPACES: [&str; 3] = ["MTSA.", "MSTS.", "MSVS."];

const VERSION_KEY: &str = "dataVersion";

const PUT_ATTEMPTS: usize = 3;

/// Global caching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSetup {
    /// Prefix of every key this SDK writes.
    pub local_storage_prefix: String,
    /// When false, cached data is still read but never written.
    pub cache_writing_enabled: bool,
}

impl Default for CacheSetup {
    fn default() -> Self {
        Self {
            local_storage_prefix: "plantyst.".to_string(),
            cache_writing_enabled: true,
        }
    }
}

/// Expected cache format version per data domain.
pub fn default_data_versions() -> BTreeMap<String, String> {
    [
        ("MTSA", "1.0"),
        ("MSTS", "1.0"),
        ("MSVS", "2.0"),
        ("measurements", "1.1"),
        ("subscriptions", "2.0"),
        ("downtimeCodes", "2.0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn major(version: Option<&str>) -> Option<&str> {
    version.and_then(|v| v.split('.').next())
}

/// Which entries [`KeyValueCache::clear`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    /// Cached series data (`MTSA.`, `MSTS.`, `MSVS.` under the prefix).
    SeriesData,
    /// Every key starting with the given full prefix.
    Prefix(String),
    /// The whole underlying store.
    All,
}

/// Shared handle to the cache store plus its setup.
#[derive(Clone)]
pub struct KeyValueCache {
    store: Arc<dyn KeyValueStore>,
    setup: CacheSetup,
}

impl std::fmt::Debug for KeyValueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueCache")
            .field("setup", &self.setup)
            .finish_non_exhaustive()
    }
}

impl Default for KeyValueCache {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStore::new()), CacheSetup::default())
    }
}

impl KeyValueCache {
    pub fn new(store: Arc<dyn KeyValueStore>, setup: CacheSetup) -> Self {
        Self { store, setup }
    }

    pub fn setup(&self) -> &CacheSetup {
        &self.setup
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Full key for a name relative to the storage prefix.
    pub fn key(&self, name: &str) -> String {
        format!("{}{name}", self.setup.local_storage_prefix)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// Write a value, evicting and retrying on failure.
    ///
    /// The first failure purges cached series data, the second purges the whole
    /// store. A third failure drops the write. Returns whether the value landed.
    pub fn put(&self, key: &str, value: &str) -> bool {
        if !self.setup.cache_writing_enabled {
            return false;
        }
        for attempt in 1..=PUT_ATTEMPTS {
            match self.store.put(key, value) {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!("Cache write of {key} failed (attempt {attempt}): {e}");
                    match attempt {
                        1 => self.clear(ClearScope::SeriesData),
                        2 => self.clear(ClearScope::All),
                        _ => {}
                    }
                }
            }
        }
        false
    }

    /// Read and decode a JSON entry. Undecodable entries count as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring unreadable cache entry {key}: {e}");
                None
            }
        }
    }

    /// Encode and [`put`](Self::put) a JSON entry.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.put(key, &raw),
            Err(e) => {
                tracing::warn!("Failed to encode cache entry {key}: {e}");
                false
            }
        }
    }

    pub fn clear(&self, scope: ClearScope) {
        match scope {
            ClearScope::All => self.store.clear(),
            ClearScope::Prefix(prefix) => self.remove_matching(|k| k.starts_with(&prefix)),
            ClearScope::SeriesData => {
                let prefixes: Vec<String> = SERIES_NAMESPACES.iter().map(|ns| self.key(ns)).collect();
                self.remove_matching(|k| prefixes.iter().any(|p| k.starts_with(p.as_str())));
            }
        }
    }

    fn remove_matching(&self, matches: impl Fn(&str) -> bool) {
        for key in self.store.keys() {
            if matches(&key) {
                self.store.remove(&key);
            }
        }
    }

    /// Purge every domain whose stored major version differs from `expected`.
    ///
    /// Returns the purged domains. The new version table is persisted only when
    /// something changed.
    pub fn version_check(&self, expected: &BTreeMap<String, String>) -> Vec<String> {
        let version_key = self.key(VERSION_KEY);
        let stored: BTreeMap<String, String> = self
            .get(&version_key)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        let mut purged = Vec::new();
        for (domain, version) in expected {
            let old = stored.get(domain).map(String::as_str);
            if major(old) != major(Some(version.as_str())) {
                tracing::info!(
                    "Cache version of {domain} changed ({} -> {version}), purging",
                    old.unwrap_or("none")
                );
                self.clear(ClearScope::Prefix(self.key(domain)));
                purged.push(domain.clone());
            }
        }

        if !purged.is_empty() {
            match serde_json::to_string(expected) {
                Ok(json) => {
                    self.put(&version_key, &json);
                }
                Err(e) => tracing::warn!("Failed to encode cache versions: {e}"),
            }
        }
        purged
    }
}
