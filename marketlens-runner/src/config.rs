//! Engine configuration file.
//!
//! One TOML document carries the core settings (client, storage, query), the
//! scheduler settings and a list of per-dataset overrides:
//!
//! ```toml
//! [storage]
//! root = "data/cache"
//!
//! [scheduler]
//! refresh_interval_secs = 300
//!
//! [[datasets]]
//! name = "markets"
//! staleness_secs = 300
//! min_volume = 1000
//! track_candles = 25        # hourly candles for the 25 most traded markets
//!
//! [[datasets]]
//! name = "candles"          # applies to every candles:<ticker> dataset
//! lookback_hours = 720
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use marketlens_core::{ClientConfig, QueryConfig, StorageConfig};

use crate::dataset::{DatasetKindTag, DatasetSpec};

/// Errors from reading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between refreshes of one dataset.
    pub refresh_interval_secs: u64,
    /// Datasets refreshed concurrently per tick.
    pub threads: usize,
    /// Refresh every registered dataset as soon as the scheduler starts.
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            threads: 4,
            run_on_start: true,
        }
    }
}

impl SchedulerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Per-dataset overrides. Every field but `name` is optional; unset fields
/// fall back to the defaults of the dataset's kind.
///
/// `name` is either a full dataset name (`candles:KXBTC-25`) or a kind
/// (`candles`), which then applies to every dataset of that kind without a
/// more specific entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DatasetConfig {
    pub name: String,
    pub enabled: Option<bool>,
    /// Maximum cache age before data is reported stale.
    pub staleness_secs: Option<u64>,
    /// Wall-clock budget for one refresh of this dataset.
    pub fetch_budget_secs: Option<u64>,
    /// Candles only: history pulled by the first refresh.
    pub lookback_hours: Option<u64>,
    /// Markets only: upstream status filter.
    pub market_status: Option<String>,
    /// Markets only: drop markets below this 24h volume.
    pub min_volume: Option<u64>,
    /// Kalshi markets only: after each successful refresh, register hourly
    /// candle datasets for up to this many of the most traded markets at or
    /// above `min_volume`. Zero turns tracking off.
    pub track_candles: Option<usize>,
}

/// Settings of one dataset after defaults and overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetPolicy {
    pub enabled: bool,
    pub staleness: Duration,
    pub fetch_budget: Option<Duration>,
    pub lookback: Duration,
    pub market_status: Option<String>,
    pub min_volume: u64,
    pub track_candles: usize,
}

impl DatasetPolicy {
    /// Defaults for a dataset kind.
    pub fn defaults(kind: DatasetKindTag) -> Self {
        let staleness = match kind {
            DatasetKindTag::Markets | DatasetKindTag::PolymarketMarkets => {
                Duration::from_secs(5 * 60)
            }
            DatasetKindTag::Candles => Duration::from_secs(10 * 60),
            DatasetKindTag::Series => Duration::from_secs(60 * 60),
        };
        Self {
            enabled: true,
            staleness,
            fetch_budget: None,
            lookback: Duration::from_secs(30 * 24 * 3600),
            market_status: Some("open".to_string()),
            min_volume: 1000,
            track_candles: 0,
        }
    }

    fn apply(&mut self, o: &DatasetConfig) {
        if let Some(v) = o.enabled {
            self.enabled = v;
        }
        if let Some(v) = o.staleness_secs {
            self.staleness = Duration::from_secs(v);
        }
        if let Some(v) = o.fetch_budget_secs {
            self.fetch_budget = Some(Duration::from_secs(v));
        }
        if let Some(v) = o.lookback_hours {
            self.lookback = Duration::from_secs(v * 3600);
        }
        if let Some(v) = &o.market_status {
            self.market_status = if v.is_empty() { None } else { Some(v.clone()) };
        }
        if let Some(v) = o.min_volume {
            self.min_volume = v;
        }
        if let Some(v) = o.track_candles {
            self.track_candles = v;
        }
    }
}

/// The whole engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub client: ClientConfig,
    pub storage: StorageConfig,
    pub query: QueryConfig,
    pub scheduler: SchedulerConfig,
    pub datasets: Vec<DatasetConfig>,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid("scheduler.refresh_interval_secs must be > 0".into()));
        }
        if self.client.requests_per_second < 0.0 {
            return Err(ConfigError::Invalid("client.requests_per_second must be >= 0".into()));
        }
        if self.client.page_size == 0 || self.client.max_intervals == 0 {
            return Err(ConfigError::Invalid(
                "client.page_size and client.max_intervals must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.client.jitter) {
            return Err(ConfigError::Invalid("client.jitter must be within [0, 1]".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for d in &self.datasets {
            if DatasetKindTag::from_name(&d.name).is_none() && d.name.parse::<DatasetSpec>().is_err() {
                return Err(ConfigError::Invalid(format!("unknown dataset '{}'", d.name)));
            }
            if !seen.insert(d.name.as_str()) {
                return Err(ConfigError::Invalid(format!("dataset '{}' listed twice", d.name)));
            }
            if d.staleness_secs == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "dataset '{}': staleness_secs must be > 0",
                    d.name
                )));
            }
        }
        Ok(())
    }

    /// Effective policy for `spec`: kind defaults, then the kind-wide entry,
    /// then the exact entry.
    pub fn policy_for(&self, spec: &DatasetSpec) -> DatasetPolicy {
        let kind = spec.kind();
        let mut policy = DatasetPolicy::defaults(kind);
        let name = spec.to_string();
        if let Some(general) = self.datasets.iter().find(|d| d.name == kind.as_str()) {
            policy.apply(general);
        }
        if name != kind.as_str() {
            if let Some(exact) = self.datasets.iter().find(|d| d.name == name) {
                policy.apply(exact);
            }
        }
        policy
    }

    /// Datasets named explicitly in the file, in file order. Kind-wide
    /// entries for parameterized kinds (`candles`) name no dataset.
    pub fn configured_datasets(&self) -> Vec<DatasetSpec> {
        self.datasets
            .iter()
            .filter_map(|d| d.name.parse::<DatasetSpec>().ok())
            .collect()
    }
}
