//! Market snapshot records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use super::{DataSource, Price, ValidationError};

/// Lifecycle status of a market as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Closed,
    Settled,
    Inactive,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Settled => "settled",
            MarketStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketStatus {
    type Err = ValidationError;

    /// Upstream uses several spellings for the same states.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" | "active" | "initialized" => Ok(MarketStatus::Open),
            "closed" => Ok(MarketStatus::Closed),
            "settled" | "determined" | "finalized" => Ok(MarketStatus::Settled),
            _ => Ok(MarketStatus::Inactive),
        }
    }
}

/// One market in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub ticker: String,
    pub title: String,
    pub event_ticker: String,
    pub series_ticker: Option<String>,
    pub yes_bid: Option<Price>,
    pub yes_ask: Option<Price>,
    pub no_bid: Option<Price>,
    pub no_ask: Option<Price>,
    pub last_price: Option<Price>,
    pub volume: u64,
    pub volume_24h: u64,
    pub open_interest: u64,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub status: MarketStatus,
    pub source: DataSource,
}

impl MarketRecord {
    /// Check record-level invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.ticker.trim().is_empty() {
            return Err(ValidationError::EmptyTicker);
        }
        if self.close_time < self.open_time {
            return Err(ValidationError::InvertedTimes {
                ticker: self.ticker.clone(),
                open: self.open_time.timestamp_millis(),
                close: self.close_time.timestamp_millis(),
            });
        }
        Ok(())
    }

    /// Bid/ask spread on the yes side, when both quotes exist.
    pub fn yes_spread(&self) -> Option<u32> {
        match (self.yes_bid, self.yes_ask) {
            (Some(bid), Some(ask)) => Some(ask.ticks().saturating_sub(bid.ticks())),
            _ => None,
        }
    }
}

/// Reject snapshots that carry the same ticker twice for one source.
pub fn validate_unique_tickers(records: &[MarketRecord]) -> Result<(), ValidationError> {
    let mut seen: HashSet<(&str, DataSource)> = HashSet::with_capacity(records.len());
    for r in records {
        if !seen.insert((r.ticker.as_str(), r.source)) {
            return Err(ValidationError::DuplicateTicker {
                ticker: r.ticker.clone(),
                origin: r.source,
            });
        }
    }
    Ok(())
}
