//! Built-in datasets served when a dataset has never been cached.
//!
//! A handful of seed Kalshi-style markets and series, all tagged
//! `DataSource::Fallback`, and an empty Polymarket snapshot and candle
//! history. These are held in memory and never written
//! to the store, so they cannot be mistaken for a prior good cache.

use chrono::{TimeZone, Utc};
use polars::prelude::DataFrame;
use std::collections::BTreeSet;

use marketlens_core::domain::{
    CandleRecord, DataSource, MarketRecord, MarketStatus, Price, SeriesRecord,
};
use marketlens_core::store::{Record, StoreError};

use crate::dataset::DatasetSpec;

/// (series, market ticker, title, 24h volume, yes price in cents)
const SEED_MARKETS: &[(&str, &str, &str, u64, u32)] = &[
    ("KXFED", "KXFED-SEED-HOLD", "Fed holds rates at next meeting", 250_000, 62),
    ("KXFED", "KXFED-SEED-CUT", "Fed cuts rates at next meeting", 180_000, 35),
    ("KXCPI", "KXCPI-SEED-ABOVE", "CPI above consensus", 90_000, 48),
    ("KXGDP", "KXGDP-SEED-POS", "GDP growth positive this quarter", 40_000, 81),
];

/// (series, title, category)
const SEED_SERIES: &[(&str, &str, &str)] = &[
    ("KXFED", "Fed rate decision", "Economics"),
    ("KXCPI", "CPI release", "Economics"),
    ("KXGDP", "GDP release", "Economics"),
];

fn price(cents: u32) -> Option<Price> {
    Price::from_cents(cents.min(100)).ok()
}

pub fn seed_markets() -> Vec<MarketRecord> {
    let open_time = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single();
    let close_time = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single();
    let (Some(open_time), Some(close_time)) = (open_time, close_time) else {
        return Vec::new();
    };
    SEED_MARKETS
        .iter()
        .map(|&(series, ticker, title, volume_24h, cents)| MarketRecord {
            ticker: ticker.to_string(),
            title: title.to_string(),
            event_ticker: format!("{series}-SEED"),
            series_ticker: Some(series.to_string()),
            yes_bid: price(cents.saturating_sub(1)),
            yes_ask: price(cents + 1),
            no_bid: price(99u32.saturating_sub(cents)),
            no_ask: price(101u32.saturating_sub(cents)),
            last_price: price(cents),
            volume: volume_24h * 20,
            volume_24h,
            open_interest: volume_24h / 2,
            open_time,
            close_time,
            status: MarketStatus::Open,
            source: DataSource::Fallback,
        })
        .collect()
}

pub fn seed_series() -> Vec<SeriesRecord> {
    SEED_SERIES
        .iter()
        .map(|&(ticker, title, category)| {
            let members: BTreeSet<String> = SEED_MARKETS
                .iter()
                .filter(|m| m.0 == ticker)
                .map(|m| m.1.to_string())
                .collect();
            SeriesRecord {
                members,
                source: DataSource::Fallback,
                ..SeriesRecord::new(ticker, title, category)
            }
        })
        .collect()
}

/// The built-in rows for `spec`, in the stored schema of its kind.
pub fn fallback_frame(spec: &DatasetSpec) -> Result<DataFrame, StoreError> {
    match spec {
        DatasetSpec::Markets => MarketRecord::to_frame(&seed_markets()),
        DatasetSpec::PolymarketMarkets => MarketRecord::to_frame(&[]),
        DatasetSpec::Series => SeriesRecord::to_frame(&seed_series()),
        DatasetSpec::Candles { .. } => CandleRecord::to_frame(&[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketlens_core::domain::{validate_series_membership, validate_unique_tickers};

    #[test]
    fn seed_records_are_valid_and_tagged() {
        let markets = seed_markets();
        assert_eq!(markets.len(), SEED_MARKETS.len());
        validate_unique_tickers(&markets).unwrap();
        for m in &markets {
            m.validate().unwrap();
            assert_eq!(m.source, DataSource::Fallback);
            assert!(m.yes_bid.unwrap() <= m.yes_ask.unwrap());
        }

        let series = seed_series();
        validate_series_membership(&series).unwrap();
        assert!(series.iter().all(|s| s.source == DataSource::Fallback));
        let fed = series.iter().find(|s| s.series_ticker == "KXFED").unwrap();
        assert_eq!(fed.members.len(), 2);
    }

    #[test]
    fn frames_use_the_stored_schema() {
        let markets = fallback_frame(&DatasetSpec::Markets).unwrap();
        assert_eq!(markets.height(), SEED_MARKETS.len());
        let names: Vec<String> = markets.get_column_names().iter().map(|c| c.to_string()).collect();
        assert_eq!(names, MarketRecord::columns());

        let poly = fallback_frame(&DatasetSpec::PolymarketMarkets).unwrap();
        assert_eq!(poly.height(), 0);
        assert_eq!(poly.width(), MarketRecord::columns().len());

        let candles = fallback_frame(&DatasetSpec::candles("T", marketlens_core::domain::Granularity::Hour)).unwrap();
        assert_eq!(candles.height(), 0);
        assert_eq!(candles.width(), CandleRecord::columns().len());
    }
}
