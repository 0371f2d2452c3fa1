//! Polymarket Gamma API adapter.
//!
//! Gamma serves market snapshots only, as a bare JSON array walked with
//! `limit`/`offset`. Prices are dollar probabilities in `[0, 1]`; volumes are
//! fractional dollars and are truncated to whole units. The market's
//! category stands in for a series so the series rollups cover both venues.
//!
//! Gamma listings are less uniform than Kalshi's: a market whose fields do
//! not form a valid record is dropped and counted instead of failing the
//! whole snapshot.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

use super::error::FetchError;
use super::rate_limited::RateLimitedClient;
use super::source::{CandleRequest, MarketDataSource, MarketQuery, SeriesQuery};
use crate::config::ClientConfig;
use crate::domain::{
    validate_unique_tickers, CandleRecord, DataSource, MarketRecord, MarketStatus, Price,
    SeriesRecord, ValidationError,
};

pub const GAMMA_BASE_URL: &str = "https://gamma-api.polymarket.com";

/// Gamma asks clients to stay near ten requests a second.
const GAMMA_REQUESTS_PER_SECOND: f64 = 10.0;

/// Largest page Gamma returns.
const GAMMA_PAGE_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    id: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    last_trade_price: Option<f64>,
    #[serde(default)]
    best_bid: Option<f64>,
    #[serde(default)]
    best_ask: Option<f64>,
    /// JSON-encoded list of decimal strings, yes outcome first.
    #[serde(default)]
    outcome_prices: Option<String>,
    #[serde(default, rename = "volume24hr")]
    volume_24hr: Option<f64>,
    #[serde(default)]
    volume_num: Option<f64>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    closed: bool,
}

fn dollars(p: f64) -> Result<Price, ValidationError> {
    Price::from_cents_f64(p * 100.0)
}

fn dollars_opt(p: Option<f64>) -> Result<Option<Price>, ValidationError> {
    p.map(dollars).transpose()
}

/// The complementary side of a binary market.
fn complement(p: Option<Price>) -> Option<Price> {
    p.and_then(|p| Price::from_ticks(Price::MAX.ticks() - p.ticks()).ok())
}

fn whole_units(v: Option<f64>) -> u64 {
    match v {
        Some(v) if v.is_finite() && v > 0.0 => v as u64,
        _ => 0,
    }
}

impl GammaMarket {
    fn status(&self) -> MarketStatus {
        if self.closed {
            MarketStatus::Closed
        } else if self.active {
            MarketStatus::Open
        } else {
            MarketStatus::Inactive
        }
    }

    fn volume_24h(&self) -> u64 {
        whole_units(self.volume_24hr)
    }

    fn yes_outcome_price(&self) -> Result<Option<Price>, ValidationError> {
        let Some(raw) = self.outcome_prices.as_deref() else {
            return Ok(None);
        };
        let prices: Vec<String> =
            serde_json::from_str(raw).map_err(|_| ValidationError::InvalidPrice(raw.to_string()))?;
        prices.first().map(|p| Price::from_dollars_str(p)).transpose()
    }

    fn into_record(self) -> Result<MarketRecord, ValidationError> {
        let last_price = match dollars_opt(self.last_trade_price)? {
            Some(p) => Some(p),
            None => self.yes_outcome_price()?,
        };
        let yes_bid = dollars_opt(self.best_bid)?;
        let yes_ask = dollars_opt(self.best_ask)?;
        let open_time = self.created_at.unwrap_or_default();
        let record = MarketRecord {
            status: self.status(),
            volume_24h: self.volume_24h(),
            volume: whole_units(self.volume_num),
            ticker: self.id,
            title: self.question,
            event_ticker: self.slug,
            series_ticker: self.category.filter(|c| !c.trim().is_empty()),
            yes_bid,
            yes_ask,
            no_bid: complement(yes_ask),
            no_ask: complement(yes_bid),
            last_price,
            open_interest: 0,
            open_time,
            close_time: self.end_date.unwrap_or(open_time),
            source: DataSource::Polymarket,
        };
        record.validate()?;
        Ok(record)
    }
}

fn param(k: &str, v: impl ToString) -> (String, String) {
    (k.to_string(), v.to_string())
}

/// Polymarket Gamma markets over a [`RateLimitedClient`].
pub struct PolymarketApi {
    client: RateLimitedClient,
}

impl PolymarketApi {
    pub fn new(client: RateLimitedClient) -> Self {
        Self { client }
    }

    /// `base` pointed at Gamma, with Gamma's request rate. Retry, budget
    /// and breaker settings carry over.
    pub fn client_config(base: &ClientConfig) -> ClientConfig {
        ClientConfig {
            base_url: GAMMA_BASE_URL.to_string(),
            requests_per_second: GAMMA_REQUESTS_PER_SECOND.min(base.requests_per_second),
            page_size: base.page_size.min(GAMMA_PAGE_LIMIT),
            ..base.clone()
        }
    }

    pub fn client(&self) -> &RateLimitedClient {
        &self.client
    }
}

impl MarketDataSource for PolymarketApi {
    fn name(&self) -> &str {
        "polymarket"
    }

    /// `status = "open"` asks Gamma for unclosed markets and drops any
    /// closed one that still comes back; other statuses are matched after
    /// conversion.
    fn fetch_markets(&self, query: &MarketQuery) -> Result<Vec<MarketRecord>, FetchError> {
        let deadline = self.client.deadline_within(query.budget);
        let wanted: Option<MarketStatus> = query
            .status
            .as_deref()
            .map(|s| s.parse::<MarketStatus>())
            .transpose()?;
        let limit = self.client.page_size().clamp(1, GAMMA_PAGE_LIMIT);
        let mut base = vec![param("limit", limit)];
        if wanted == Some(MarketStatus::Open) {
            base.push(param("closed", "false"));
        }

        let mut wire: Vec<GammaMarket> = Vec::new();
        let mut pages = 0u32;
        loop {
            if pages >= self.client.max_pages() {
                return Err(FetchError::Malformed(format!(
                    "/markets: listing did not end after {pages} pages"
                )));
            }
            let mut q = base.clone();
            q.push(param("offset", wire.len()));
            let page: Vec<GammaMarket> = self.client.get_json_until("/markets", &q, deadline)?;
            pages += 1;
            let n = page.len();
            debug!(page = pages, items = n, "gamma page fetched");
            wire.extend(page);
            if n < limit as usize {
                break;
            }
        }
        let fetched = wire.len();

        // Offsets shift while walking; a market seen twice keeps its latest
        // version at the first position.
        let mut order: Vec<GammaMarket> = Vec::with_capacity(wire.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(wire.len());
        for m in wire.into_iter().filter(|m| m.volume_24h() >= query.min_volume) {
            match index.get(&m.id) {
                Some(&i) => order[i] = m,
                None => {
                    index.insert(m.id.clone(), order.len());
                    order.push(m);
                }
            }
        }

        let mut dropped = 0usize;
        let records: Vec<MarketRecord> = order
            .into_iter()
            .filter_map(|m| {
                let id = m.id.clone();
                match m.into_record() {
                    Ok(r) => Some(r),
                    Err(e) => {
                        dropped += 1;
                        debug!(market = %id, error = %e, "gamma market dropped");
                        None
                    }
                }
            })
            .filter(|r| wanted.map_or(true, |s| r.status == s))
            .collect();
        validate_unique_tickers(&records)?;
        info!(fetched, kept = records.len(), dropped, min_volume = query.min_volume, "polymarket markets fetched");
        Ok(records)
    }

    /// Gamma has no series resource.
    fn fetch_series(&self, _query: &SeriesQuery) -> Result<Vec<SeriesRecord>, FetchError> {
        Ok(Vec::new())
    }

    /// Gamma has no candle resource.
    fn fetch_candles(&self, _request: &CandleRequest) -> Result<Vec<CandleRecord>, FetchError> {
        Ok(Vec::new())
    }
}
