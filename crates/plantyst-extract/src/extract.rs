//! One extraction run: config in, CSV tables out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use plantyst::{
    AggregationSource, Auth, CacheSetup, Clock, CommunicationSetup, EngineConfig, FetchEngine,
    FileStore, HttpBridge, KeyValueCache, KeyValueStore, MemoryStore, SdkContext, SeriesQuery,
    SystemClock, TimeRange,
};

use crate::config::{ExtractorConfig, OUTPUT_FILES_DIR};
use crate::output::{generate_manifests, rows, table_name, write_csv};
use crate::ExtractError;

/// What a run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractSummary {
    pub window: TimeRange,
    pub rows: usize,
    pub table: Option<PathBuf>,
    pub manifests: usize,
}

pub struct Extractor {
    config: ExtractorConfig,
    clock: Arc<dyn Clock>,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// SDK context for this run. Without a cache directory the cache is an
    /// in-memory, read-only one, so only the requested window is fetched.
    pub fn context(&self) -> Result<SdkContext, ExtractError> {
        let (store, setup): (Arc<dyn KeyValueStore>, CacheSetup) = match &self.config.cache_dir {
            Some(dir) => (Arc::new(FileStore::new(dir)?), CacheSetup::default()),
            None => (
                Arc::new(MemoryStore::new()),
                CacheSetup {
                    cache_writing_enabled: false,
                    ..CacheSetup::default()
                },
            ),
        };

        let communication = CommunicationSetup {
            base_api_url: self.config.api_uri.clone(),
        };
        let bridge = HttpBridge::new(&communication, Auth::Bearer(self.config.api_token.clone()))?
            .with_clock(self.clock.clone());

        let context = SdkContext::new(KeyValueCache::new(store, setup), Arc::new(bridge))
            .with_clock(self.clock.clone());
        let purged = context.initialize();
        if !purged.is_empty() {
            tracing::info!("Purged outdated cache domains: {}", purged.join(", "));
        }
        Ok(context)
    }

    /// Fetch the configured window and write it under `<data_dir>/out/tables`.
    pub async fn run(&self, data_dir: &Path) -> Result<ExtractSummary, ExtractError> {
        let now = self.clock.now();
        let from = self
            .config
            .changed_in_last
            .window_start(now)
            .ok_or(ExtractError::InvalidWindow)?;
        tracing::info!("Reading plantyst data since {} ...", from.to_rfc3339());

        let source = AggregationSource::default().with_endpoint(self.config.endpoint.clone());
        let engine = FetchEngine::new(source, self.context()?, EngineConfig::default());

        let id = self.config.measurement_id;
        let query = SeriesQuery::aggregation(id, from, now, &self.config.granularity);
        let result = engine.fetch(query)?.result().await?;

        let rows = rows(id, &result);
        let out_dir = data_dir.join(OUTPUT_FILES_DIR);
        let table = write_csv(&out_dir, &table_name(id), &rows)?;
        let manifests = generate_manifests(&out_dir)?;

        Ok(ExtractSummary {
            window: TimeRange::between(from, now),
            rows: rows.len(),
            table,
            manifests,
        })
    }
}
