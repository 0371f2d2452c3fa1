//! MarketLens Core: domain records, upstream client, columnar cache, queries.
//!
//! This crate contains the data path of the caching engine:
//! - Domain records (markets, candles, series) with validated prices
//! - Rate-limited, retrying HTTP client and the Kalshi API adapter
//! - Partitioned Parquet store with atomic writes and compaction
//! - Query engine with projection, partition pruning and aggregation

pub mod client;
pub mod config;
pub mod domain;
pub mod query;
pub mod store;

pub use config::{ClientConfig, CompressionCodec, QueryConfig, StorageConfig};
