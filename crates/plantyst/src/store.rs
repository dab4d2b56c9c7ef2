//! Key/value stores backing the series cache.
//!
//! A store is synchronous and string-typed. Writes may fail with
//! [`StoreError::QuotaExceeded`]; the cache layer above recovers from that by
//! evicting and retrying.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Errors raised by key/value stores.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous string key/value storage shared by every engine instance.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str);

    fn keys(&self) -> Vec<String>;

    /// Remove every entry.
    fn clear(&self) {
        for key in self.keys() {
            self.remove(&key);
        }
    }
}

/// In-memory store with an optional byte quota over keys and values.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota: Some(quota),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.lock();
        if let Some(quota) = self.quota {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = used + key.len() + value.len();
            if needed > quota {
                return Err(StoreError::QuotaExceeded { needed, quota });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

const ENTRY_EXT: &str = "entry";

/// Bytes escaped in file names: everything but `[A-Za-z0-9._-]`.
const KEY_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'_').remove(b'-');

/// Directory-backed store, one file per key.
///
/// File names are the key with every byte outside `[A-Za-z0-9._-]` written as
/// `%XX`, so `keys()` can recover the original key from a directory listing.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    quota: Option<usize>,
}

impl FileStore {
    /// Open (creating if needed) a store in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        tracing::debug!("FileStore opened at {}", dir.display());
        Ok(Self { dir, quota: None })
    }

    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    /// `~/.plantyst/cache`, or `/tmp/.plantyst/cache` without a home directory.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".plantyst")
            .join("cache")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{ENTRY_EXT}", encode_key(key)))
    }

    fn used_bytes(&self, except: &Path) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|e| e.path() != except)
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len() as usize)
            .sum()
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(quota) = self.quota {
            let needed = self.used_bytes(&path) + value.len();
            if needed > quota {
                return Err(StoreError::QuotaExceeded { needed, quota });
            }
        }
        fs::write(&path, value)?;
        Ok(())
    }

    fn remove(&self, key: &str) {
        let path = self.path_for(key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove cache file {}: {e}", path.display());
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) != Some(ENTRY_EXT) {
                    return None;
                }
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(decode_key)
            })
            .collect()
    }
}

fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ESCAPES).to_string()
}

fn decode_key(name: &str) -> Option<String> {
    percent_decode_str(name)
        .decode_utf8()
        .ok()
        .map(|key| key.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert!(store.get("a").is_none());
        store.put("a", "1").unwrap();
        store.put("b", "2").unwrap();
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(store.len(), 2);
        store.remove("a");
        assert!(store.get("a").is_none());
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_quota() {
        let store = MemoryStore::with_quota(10);
        store.put("k1", "abcd").unwrap();
        let err = store.put("k2", "abcdefgh").unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { quota: 10, .. }));
        // Overwriting an existing key only counts the new value.
        store.put("k1", "abcdefgh").unwrap();
    }

    #[test]
    fn test_key_encoding_round_trip() {
        let key = "plantyst.MTSA.1268.V.B.MinS.20200101";
        assert_eq!(encode_key(key), key);
        let odd = "a/b c%";
        let encoded = encode_key(odd);
        assert_eq!(encoded, "a%2Fb%20c%25");
        assert_eq!(decode_key(&encoded).as_deref(), Some(odd));
        assert_eq!(encode_key("zürich"), "z%C3%BCrich");
        assert_eq!(decode_key("z%C3%BCrich").as_deref(), Some("zürich"));
        assert!(decode_key("bad%FF").is_none());
    }

    #[test]
    fn test_file_store_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(dir.path()).unwrap();
            store.put("plantyst.MTSA.1.V.B.H.202001", "{}").unwrap();
            store.put("plantyst.version.MTSA", "1.0").unwrap();
        }
        let store = FileStore::new(dir.path()).unwrap();
        let mut keys = store.keys();
        keys.sort();
        assert_eq!(
            keys,
            vec!["plantyst.MTSA.1.V.B.H.202001", "plantyst.version.MTSA"]
        );
        assert_eq!(store.get("plantyst.version.MTSA").as_deref(), Some("1.0"));

        store.clear();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_file_store_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap().with_quota(8);
        store.put("a", "12345").unwrap();
        assert!(matches!(
            store.put("b", "12345"),
            Err(StoreError::QuotaExceeded { .. })
        ));
        store.put("a", "12345678").unwrap();
    }
}
