//! Composition root: the shared collaborators every engine is built from.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::Bridge;
use crate::cache::{default_data_versions, KeyValueCache};
use crate::clock::{Clock, SystemClock};

/// Where the API lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationSetup {
    /// Base URL, endpoint names are appended to it verbatim.
    pub base_api_url: String,
}

impl Default for CommunicationSetup {
    fn default() -> Self {
        Self {
            base_api_url: "https://portal.plantyst.com/api/".to_string(),
        }
    }
}

/// Fetch engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Window during which fetches are batched together.
    pub process_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_delay: Duration::from_millis(1),
        }
    }
}

/// Explicitly owned SDK state, shared by every engine built from it.
#[derive(Clone)]
pub struct SdkContext {
    pub cache: KeyValueCache,
    pub bridge: Arc<dyn Bridge>,
    pub clock: Arc<dyn Clock>,
}

impl SdkContext {
    pub fn new(cache: KeyValueCache, bridge: Arc<dyn Bridge>) -> Self {
        Self {
            cache,
            bridge,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Purge cache domains written by an incompatible SDK version.
    ///
    /// Call once at startup, before the first fetch.
    pub fn initialize(&self) -> Vec<String> {
        self.cache.version_check(&default_data_versions())
    }
}

impl std::fmt::Debug for SdkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkContext")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeError, BridgeRequest};

    struct NoNetwork;

    #[async_trait::async_trait]
    impl Bridge for NoNetwork {
        async fn send(&self, _request: BridgeRequest) -> Result<serde_json::Value, BridgeError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_initialize_purges_once() {
        let context = SdkContext::new(KeyValueCache::default(), Arc::new(NoNetwork));
        let purged = context.initialize();
        assert_eq!(purged.len(), default_data_versions().len());
        assert!(context.initialize().is_empty());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(
            CommunicationSetup::default().base_api_url,
            "https://portal.plantyst.com/api/"
        );
        assert_eq!(EngineConfig::default().process_delay, Duration::from_millis(1));
    }
}
