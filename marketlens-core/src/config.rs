//! Core configuration values.
//!
//! These are plain serde structs with defaults; loading them from a file is
//! the embedding process's job (see `marketlens-runner::config`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Upstream client tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// API root, e.g. `https://api.elections.kalshi.com`.
    pub base_url: String,

    /// Sustained request rate through the gate.
    pub requests_per_second: f64,

    /// Bucket capacity; how many requests may go out back-to-back.
    pub burst: u32,

    /// Retries after the first attempt for Transient / RateLimited failures.
    pub max_retries: u32,

    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Random spread applied to each backoff delay, as a fraction (0.2 = ±20%).
    pub jitter: f64,

    /// Wall-clock budget for one fetch, retries and waits included.
    pub fetch_budget_secs: u64,

    /// Per-request socket timeout.
    pub request_timeout_secs: u64,

    /// Records requested per page for cursor-paginated resources.
    pub page_size: u32,

    /// Safety bound on pages followed per fetch.
    pub max_pages: u32,

    /// Upstream cap on intervals per candlestick request.
    pub max_intervals: u32,

    /// Consecutive exhausted fetches before the circuit opens.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.elections.kalshi.com".to_string(),
            requests_per_second: 10.0,
            burst: 10,
            max_retries: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter: 0.2,
            fetch_budget_secs: 60,
            request_timeout_secs: 10,
            page_size: 1000,
            max_pages: 500,
            max_intervals: 5000,
            breaker_threshold: 3,
            breaker_cooldown_secs: 300,
        }
    }
}

impl ClientConfig {
    pub fn fetch_budget(&self) -> Duration {
        Duration::from_secs(self.fetch_budget_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Lossless Parquet codec for cache files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    Zstd,
    Snappy,
    Uncompressed,
}

/// Columnar store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Cache root; one sub-directory per dataset.
    pub root: PathBuf,
    pub compression: CompressionCodec,
    /// Rows per Parquet row group. `None` uses the writer default.
    pub row_group_size: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/cache"),
            compression: CompressionCodec::Zstd,
            row_group_size: Some(100_000),
        }
    }
}

/// Query engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    /// Partitions decoded concurrently per query.
    pub threads: usize,
    /// Hard cap on rows returned by one query.
    pub max_rows: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            max_rows: 1_000_000,
        }
    }
}
