//! Shared fixtures: a scripted upstream that counts fetches.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use marketlens_core::client::{
    CandleRequest, FetchError, MarketDataSource, MarketQuery, SeriesQuery,
};
use marketlens_core::domain::{
    CandleRecord, DataSource, Granularity, MarketRecord, MarketStatus, Price, SeriesRecord,
};
use marketlens_core::store::ColumnarStore;
use marketlens_runner::{CacheRegistry, EngineConfig, MarketDataService};

pub type Scripted<T> = Mutex<VecDeque<Result<Vec<T>, FetchError>>>;

/// Replays queued results per resource. An exhausted script answers with a
/// transient failure.
#[derive(Default)]
pub struct ScriptedSource {
    pub markets: Scripted<MarketRecord>,
    pub series: Scripted<SeriesRecord>,
    pub candles: Scripted<CandleRecord>,
    pub market_calls: AtomicUsize,
    pub series_calls: AtomicUsize,
    pub candle_calls: AtomicUsize,
    pub candle_requests: Mutex<Vec<CandleRequest>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_markets(&self, r: Result<Vec<MarketRecord>, FetchError>) {
        self.markets.lock().push_back(r);
    }

    pub fn push_series(&self, r: Result<Vec<SeriesRecord>, FetchError>) {
        self.series.lock().push_back(r);
    }

    pub fn push_candles(&self, r: Result<Vec<CandleRecord>, FetchError>) {
        self.candles.lock().push_back(r);
    }

    pub fn calls(&self) -> usize {
        self.market_calls.load(Ordering::SeqCst)
            + self.series_calls.load(Ordering::SeqCst)
            + self.candle_calls.load(Ordering::SeqCst)
    }
}

fn next<T>(script: &Scripted<T>) -> Result<Vec<T>, FetchError> {
    script.lock().pop_front().unwrap_or_else(|| {
        Err(FetchError::Transient {
            attempts: 1,
            message: "script exhausted".into(),
        })
    })
}

impl MarketDataSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch_markets(&self, _query: &MarketQuery) -> Result<Vec<MarketRecord>, FetchError> {
        self.market_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.markets)
    }

    fn fetch_series(&self, _query: &SeriesQuery) -> Result<Vec<SeriesRecord>, FetchError> {
        self.series_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.series)
    }

    fn fetch_candles(&self, request: &CandleRequest) -> Result<Vec<CandleRecord>, FetchError> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        self.candle_requests.lock().push(request.clone());
        next(&self.candles)
    }
}

pub fn market(ticker: &str, series: &str, volume_24h: u64) -> MarketRecord {
    MarketRecord {
        ticker: ticker.to_string(),
        title: format!("{ticker} resolves yes"),
        event_ticker: format!("{series}-EV"),
        series_ticker: Some(series.to_string()),
        yes_bid: Some(Price::from_cents(40).unwrap()),
        yes_ask: Some(Price::from_cents(42).unwrap()),
        no_bid: Some(Price::from_cents(58).unwrap()),
        no_ask: Some(Price::from_cents(60).unwrap()),
        last_price: Some(Price::from_cents(41).unwrap()),
        volume: volume_24h * 10,
        volume_24h,
        open_interest: 100,
        open_time: Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).unwrap(),
        close_time: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        status: MarketStatus::Open,
        source: DataSource::Kalshi,
    }
}

pub fn markets() -> Vec<MarketRecord> {
    vec![
        market("REAL-A", "KXA", 5_000),
        market("REAL-B", "KXA", 3_000),
        market("REAL-C", "KXB", 9_000),
    ]
}

pub fn series(ticker: &str) -> SeriesRecord {
    SeriesRecord::new(ticker, format!("{ticker} series"), "Economics")
}

/// Hourly candles for `ticker` starting at `first`.
pub fn candles(ticker: &str, first: DateTime<Utc>, n: usize) -> Vec<CandleRecord> {
    (0..n as i64)
        .map(|i| {
            let cents = (i % 90 + 5) as u32;
            CandleRecord {
                ticker: ticker.to_string(),
                start: first + Duration::hours(i),
                open: Some(Price::from_cents(cents).unwrap()),
                high: Some(Price::from_cents(cents + 2).unwrap()),
                low: Some(Price::from_cents(cents).unwrap()),
                close: Some(Price::from_cents(cents + 1).unwrap()),
                volume: 10 + i as u64,
                granularity: Granularity::Hour,
            }
        })
        .collect()
}

/// Current hour, truncated.
pub fn this_hour() -> DateTime<Utc> {
    let now = Utc::now().timestamp();
    DateTime::from_timestamp(now - now.rem_euclid(3600), 0).unwrap()
}

pub fn transient() -> FetchError {
    FetchError::Transient {
        attempts: 6,
        message: "HTTP 503: unavailable".into(),
    }
}

pub fn auth_failure() -> FetchError {
    FetchError::Permanent {
        status: 401,
        message: "HTTP 401: unauthorized".into(),
    }
}

/// A service over a fresh registry and `store`.
pub fn service_over(
    store: &Arc<ColumnarStore>,
    source: Arc<dyn MarketDataSource>,
    config: EngineConfig,
) -> MarketDataService {
    MarketDataService::with_parts(config, source, Arc::clone(store), Arc::new(CacheRegistry::new()))
        .unwrap()
}
