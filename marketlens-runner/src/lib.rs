//! MarketLens Runner: refresh orchestration and the consumer contract.
//!
//! This crate builds on `marketlens-core` to provide:
//! - Logical dataset names and their store locations
//! - The cache entry registry, hydrated from the store on first touch
//! - Fetch / stale-cache / built-in fallback orchestration, single-flight
//!   per dataset
//! - A background refresh scheduler on a private thread pool
//! - `MarketDataService`: `get_dataset`, `trigger_refresh`,
//!   `freshness_report`, canned market queries and the unified
//!   Kalshi + Polymarket market view
//! - A single on-demand refresh worker for use without a scheduler
//! - The engine configuration file

pub mod config;
pub mod dataset;
pub mod fallback;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use config::{ConfigError, DatasetConfig, DatasetPolicy, EngineConfig, SchedulerConfig};
pub use dataset::{DatasetKindTag, DatasetNameError, DatasetSpec, StoreLocation};
pub use orchestrator::{FallbackOrchestrator, RefreshError};
pub use registry::{
    CacheEntry, CacheRegistry, DatasetState, Freshness, LastError, RefreshOutcome, Staleness,
};
pub use scheduler::{
    LoggingObserver, RefreshObserver, RefreshScheduler, SchedulerError, SchedulerHandle, TickReport,
};
pub use service::{
    DatasetView, MarketDataService, RowSource, ServiceError, SourceStatus, UnifiedMarkets,
};
