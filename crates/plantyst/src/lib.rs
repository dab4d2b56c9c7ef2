//! Plantyst: client SDK for batched, cached, gap-merging measurement series fetches,
//! plus the metadata providers around them.

pub mod bridge;
pub mod cache;
pub mod clock;
pub mod context;
pub mod engine;
pub mod interval;
pub mod promise;
pub mod providers;
pub mod queue;
pub mod source;
pub mod store;
pub mod types;
pub mod view;
pub mod wire;

mod coalesce;
mod item;
mod partition;

pub use bridge::{Auth, Bridge, BridgeError, BridgeRequest, Claims, HttpBridge, JwtSettings};
pub use cache::{CacheSetup, ClearScope, KeyValueCache};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::{CommunicationSetup, EngineConfig, SdkContext};
pub use engine::{AggregationEngine, FetchEngine, StateSumEngine};
pub use promise::{FetchEvent, FetchHandle};
pub use providers::{
    DowntimeCode, DowntimeCodesProvider, Measurement, MeasurementProvider, MetricsProvider,
    MetricsQuery, QuotaProvider, QuotaQuery, QuotaUpdate, SubscriptionProvider, Subscriptions,
};
pub use source::{AggregationSource, SeriesSource, StateSumKind, StateSumSource};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
pub use types::*;
pub use view::{PartitionUnit, View, ViewCatalog};
