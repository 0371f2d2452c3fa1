//! Logical dataset names and where each one lives in the store.
//!
//! Consumers address data by name: `markets` (Kalshi), `polymarket_markets`,
//! `series`, or `candles:<ticker>[:<granularity>]` (hourly when the
//! granularity is omitted). Every candle dataset shares the store dataset
//! `candles`, one partition per (ticker, granularity).

use std::fmt;
use std::str::FromStr;

use marketlens_core::domain::{DataSource, Granularity};
use marketlens_core::query::views::MARKETS_DATASET;
use marketlens_core::query::Predicate;
use marketlens_core::store::PartitionKey;
use thiserror::Error;

pub const POLYMARKET_MARKETS_DATASET: &str = "polymarket_markets";
pub const SERIES_DATASET: &str = "series";
pub const CANDLES_DATASET: &str = "candles";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatasetNameError {
    #[error("unknown dataset '{0}'")]
    Unknown(String),

    #[error("candle dataset '{0}' needs a ticker, e.g. candles:KXBTC")]
    MissingTicker(String),

    #[error("dataset '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Kind of a logical dataset, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKindTag {
    Markets,
    PolymarketMarkets,
    Series,
    Candles,
}

impl DatasetKindTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKindTag::Markets => MARKETS_DATASET,
            DatasetKindTag::PolymarketMarkets => POLYMARKET_MARKETS_DATASET,
            DatasetKindTag::Series => SERIES_DATASET,
            DatasetKindTag::Candles => CANDLES_DATASET,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            MARKETS_DATASET => Some(DatasetKindTag::Markets),
            POLYMARKET_MARKETS_DATASET => Some(DatasetKindTag::PolymarketMarkets),
            SERIES_DATASET => Some(DatasetKindTag::Series),
            CANDLES_DATASET => Some(DatasetKindTag::Candles),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatasetSpec {
    /// Kalshi market snapshot.
    Markets,
    /// Polymarket market snapshot, same schema as `Markets`.
    PolymarketMarkets,
    Series,
    Candles { ticker: String, granularity: Granularity },
}

/// Store dataset and partition backing a logical dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    pub dataset: &'static str,
    pub partition: PartitionKey,
}

impl DatasetSpec {
    pub fn candles(ticker: impl Into<String>, granularity: Granularity) -> Self {
        DatasetSpec::Candles {
            ticker: ticker.into(),
            granularity,
        }
    }

    pub fn kind(&self) -> DatasetKindTag {
        match self {
            DatasetSpec::Markets => DatasetKindTag::Markets,
            DatasetSpec::PolymarketMarkets => DatasetKindTag::PolymarketMarkets,
            DatasetSpec::Series => DatasetKindTag::Series,
            DatasetSpec::Candles { .. } => DatasetKindTag::Candles,
        }
    }

    pub fn location(&self) -> StoreLocation {
        match self {
            DatasetSpec::Markets => StoreLocation {
                dataset: MARKETS_DATASET,
                partition: PartitionKey::Whole,
            },
            DatasetSpec::PolymarketMarkets => StoreLocation {
                dataset: POLYMARKET_MARKETS_DATASET,
                partition: PartitionKey::Whole,
            },
            DatasetSpec::Series => StoreLocation {
                dataset: SERIES_DATASET,
                partition: PartitionKey::Whole,
            },
            DatasetSpec::Candles {
                ticker,
                granularity,
            } => StoreLocation {
                dataset: CANDLES_DATASET,
                partition: PartitionKey::series(ticker.clone(), *granularity),
            },
        }
    }

    /// Venue whose market snapshot this is, for market datasets.
    pub fn origin(&self) -> Option<DataSource> {
        match self {
            DatasetSpec::Markets => Some(DataSource::Kalshi),
            DatasetSpec::PolymarketMarkets => Some(DataSource::Polymarket),
            DatasetSpec::Series | DatasetSpec::Candles { .. } => None,
        }
    }

    /// The market snapshot dataset of `source`.
    pub fn markets_of(source: DataSource) -> Option<Self> {
        match source {
            DataSource::Kalshi => Some(DatasetSpec::Markets),
            DataSource::Polymarket => Some(DatasetSpec::PolymarketMarkets),
            DataSource::Fallback => None,
        }
    }

    /// Predicate selecting this dataset's rows inside its store dataset.
    pub fn scope(&self) -> Predicate {
        match self {
            DatasetSpec::Markets | DatasetSpec::PolymarketMarkets | DatasetSpec::Series => {
                Predicate::True
            }
            DatasetSpec::Candles {
                ticker,
                granularity,
            } => Predicate::eq("ticker", ticker.as_str())
                .and(Predicate::eq("granularity", granularity.tag())),
        }
    }
}

impl fmt::Display for DatasetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetSpec::Markets => f.write_str(MARKETS_DATASET),
            DatasetSpec::PolymarketMarkets => f.write_str(POLYMARKET_MARKETS_DATASET),
            DatasetSpec::Series => f.write_str(SERIES_DATASET),
            DatasetSpec::Candles {
                ticker,
                granularity: Granularity::Hour,
            } => write!(f, "{CANDLES_DATASET}:{ticker}"),
            DatasetSpec::Candles {
                ticker,
                granularity,
            } => write!(f, "{CANDLES_DATASET}:{ticker}:{granularity}"),
        }
    }
}

impl FromStr for DatasetSpec {
    type Err = DatasetNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [MARKETS_DATASET] => Ok(DatasetSpec::Markets),
            [POLYMARKET_MARKETS_DATASET] => Ok(DatasetSpec::PolymarketMarkets),
            [SERIES_DATASET] => Ok(DatasetSpec::Series),
            [CANDLES_DATASET] => Err(DatasetNameError::MissingTicker(s.to_string())),
            [CANDLES_DATASET, ticker, rest @ ..] => {
                let ticker = ticker.trim();
                if ticker.is_empty() {
                    return Err(DatasetNameError::MissingTicker(s.to_string()));
                }
                let invalid = |reason: String| DatasetNameError::Invalid {
                    name: s.to_string(),
                    reason,
                };
                let granularity = match rest {
                    [] => Granularity::Hour,
                    [g] => g.parse::<Granularity>().map_err(|e| invalid(e.to_string()))?,
                    _ => return Err(invalid("too many ':' separated parts".into())),
                };
                Ok(DatasetSpec::candles(ticker, granularity))
            }
            _ => Err(DatasetNameError::Unknown(s.to_string())),
        }
    }
}
