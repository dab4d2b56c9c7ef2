//! Plantyst extractor: pulls one measurement series through the SDK into CSV tables.

pub mod config;
pub mod extract;
pub mod output;

pub use config::{resolve_data_dir, ConfigError, ExtractorConfig};
pub use extract::{ExtractSummary, Extractor};

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] plantyst::FetchError),

    #[error("Cannot set up the API client: {0}")]
    Bridge(#[from] plantyst::BridgeError),

    #[error("Cache store error: {0}")]
    Store(#[from] plantyst::StoreError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Extraction window reaches before the representable time range")]
    InvalidWindow,
}
