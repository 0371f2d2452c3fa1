//! Upstream data source abstraction.
//!
//! The orchestrator depends on this trait rather than on a concrete API so
//! that tests can substitute scripted sources and count fetches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::FetchError;
use crate::domain::{CandleRecord, Granularity, MarketRecord, SeriesRecord};

/// Parameters for a market snapshot fetch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketQuery {
    /// Upstream status filter, e.g. `open`.
    pub status: Option<String>,
    /// Drop markets whose 24h volume is below this.
    pub min_volume: u64,
    /// Restrict to one series.
    pub series_ticker: Option<String>,
    /// Resolve each market's series through its event.
    pub enrich_series: bool,
    /// Wall-clock budget for the whole fetch, pagination included.
    #[serde(skip)]
    pub budget: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeriesQuery {
    pub category: Option<String>,
    /// Populate member tickers from events with nested markets.
    pub with_members: bool,
    #[serde(skip)]
    pub budget: Option<Duration>,
}

/// A candle window for one market.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleRequest {
    pub ticker: String,
    /// Looked up through market → event when absent.
    pub series_ticker: Option<String>,
    pub granularity: Granularity,
    /// First interval start (inclusive).
    pub start: DateTime<Utc>,
    /// Window end (exclusive).
    pub end: DateTime<Utc>,
    /// Budget across every chunk of the window.
    pub budget: Option<Duration>,
}

pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &str;

    fn fetch_markets(&self, query: &MarketQuery) -> Result<Vec<MarketRecord>, FetchError>;

    fn fetch_series(&self, query: &SeriesQuery) -> Result<Vec<SeriesRecord>, FetchError>;

    /// Candles ordered by interval start, without duplicates.
    fn fetch_candles(&self, request: &CandleRequest) -> Result<Vec<CandleRecord>, FetchError>;
}
