//! Domain types for cached market data.

pub mod candle;
pub mod market;
pub mod price;
pub mod series;

pub use candle::{resample_daily, validate_candle_sequence, CandleRecord, Granularity};
pub use market::{validate_unique_tickers, MarketRecord, MarketStatus};
pub use price::Price;
pub use series::{validate_series_membership, SeriesRecord};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Kalshi,
    Polymarket,
    /// Built-in minimal dataset served when no cache exists.
    Fallback,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Kalshi => "kalshi",
            DataSource::Polymarket => "polymarket",
            DataSource::Fallback => "fallback",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kalshi" => Ok(DataSource::Kalshi),
            "polymarket" => Ok(DataSource::Polymarket),
            "fallback" => Ok(DataSource::Fallback),
            other => Err(ValidationError::UnknownSource(other.to_string())),
        }
    }
}

/// Record construction failures.
///
/// Raised at the client boundary when an upstream payload does not satisfy
/// the invariants of the typed records.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("price {0} is outside [0, 100] cents")]
    PriceOutOfRange(f64),

    #[error("invalid price literal '{0}'")]
    InvalidPrice(String),

    #[error("empty ticker")]
    EmptyTicker,

    #[error("duplicate ticker '{ticker}' within source {origin}")]
    DuplicateTicker { ticker: String, origin: DataSource },

    #[error("candles for {ticker} are not strictly increasing at {at}")]
    CandleOrder { ticker: String, at: i64 },

    #[error("candle for {found} in a sequence for {expected}")]
    MixedCandleSequence { expected: String, found: String },

    #[error("ticker '{ticker}' belongs to both '{first}' and '{second}'")]
    DuplicateMembership {
        ticker: String,
        first: String,
        second: String,
    },

    #[error("close time {close} precedes open time {open} for {ticker}")]
    InvertedTimes {
        ticker: String,
        open: i64,
        close: i64,
    },

    #[error("unknown granularity '{0}'")]
    UnknownGranularity(String),

    #[error("unknown data source '{0}'")]
    UnknownSource(String),

    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),
}

/// Convert epoch milliseconds to a UTC timestamp.
pub(crate) fn from_epoch_millis(ms: i64) -> Result<chrono::DateTime<chrono::Utc>, ValidationError> {
    chrono::DateTime::from_timestamp_millis(ms).ok_or(ValidationError::InvalidTimestamp(ms))
}

/// Convert epoch seconds to a UTC timestamp.
pub(crate) fn from_epoch_secs(secs: i64) -> Result<chrono::DateTime<chrono::Utc>, ValidationError> {
    chrono::DateTime::from_timestamp(secs, 0).ok_or(ValidationError::InvalidTimestamp(secs))
}
