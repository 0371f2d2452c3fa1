//! Record ⇄ DataFrame encoding.
//!
//! Prices are stored as nullable `UInt32` ticks and timestamps as `Int64`
//! epoch milliseconds (UTC), so every value round-trips exactly.

use polars::prelude::*;

use super::error::StoreError;
use super::manifest::DatasetKind;
use super::partition::PartitionKey;
use crate::domain::{
    from_epoch_millis, CandleRecord, DataSource, Granularity, MarketRecord, MarketStatus, Price,
    SeriesRecord,
};

/// A record type the store can persist.
pub trait Record: Sized + Clone + Send + Sync + 'static {
    const KIND: DatasetKind;

    /// Stored columns, in file order.
    fn columns() -> &'static [&'static str];

    fn partition_key(&self) -> PartitionKey;

    /// Position within a time-series partition (epoch ms); `None` for
    /// snapshot records.
    fn order_key(&self) -> Option<i64>;

    /// Identity within a partition; a later write with the same identity
    /// replaces an earlier one during compaction.
    fn identity(&self) -> String;

    fn to_frame(records: &[Self]) -> Result<DataFrame, StoreError>;

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError>;
}

// ── Column helpers ──────────────────────────────────────────────────

fn column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Column, StoreError> {
    df.column(name)
        .map_err(|e| StoreError::Codec(format!("missing column '{name}': {e}")))
}

fn strings(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, StoreError> {
    let ca = column(df, name)?
        .str()
        .map_err(|e| StoreError::Codec(format!("{name} column type: {e}")))?;
    Ok(ca.into_iter().map(|v| v.map(str::to_string)).collect())
}

fn required_strings(df: &DataFrame, name: &str) -> Result<Vec<String>, StoreError> {
    strings(df, name)?
        .into_iter()
        .enumerate()
        .map(|(i, v)| v.ok_or_else(|| StoreError::Codec(format!("null {name} at row {i}"))))
        .collect()
}

fn u32s(df: &DataFrame, name: &str) -> Result<Vec<Option<u32>>, StoreError> {
    let ca = column(df, name)?
        .u32()
        .map_err(|e| StoreError::Codec(format!("{name} column type: {e}")))?;
    Ok(ca.into_iter().collect())
}

fn u64s(df: &DataFrame, name: &str) -> Result<Vec<u64>, StoreError> {
    let ca = column(df, name)?
        .u64()
        .map_err(|e| StoreError::Codec(format!("{name} column type: {e}")))?;
    Ok(ca.into_iter().map(|v| v.unwrap_or(0)).collect())
}

fn i64s(df: &DataFrame, name: &str) -> Result<Vec<i64>, StoreError> {
    let ca = column(df, name)?
        .i64()
        .map_err(|e| StoreError::Codec(format!("{name} column type: {e}")))?;
    ca.into_iter()
        .enumerate()
        .map(|(i, v)| v.ok_or_else(|| StoreError::Codec(format!("null {name} at row {i}"))))
        .collect()
}

fn prices(df: &DataFrame, name: &str) -> Result<Vec<Option<Price>>, StoreError> {
    u32s(df, name)?
        .into_iter()
        .map(|v| {
            v.map(Price::from_ticks)
                .transpose()
                .map_err(|e| StoreError::Codec(format!("{name}: {e}")))
        })
        .collect()
}

fn ticks(values: impl Iterator<Item = Option<Price>>) -> Vec<Option<u32>> {
    values.map(|p| p.map(Price::ticks)).collect()
}

fn timestamp(ms: i64) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
    from_epoch_millis(ms).map_err(|e| StoreError::Codec(e.to_string()))
}

// ── Markets ─────────────────────────────────────────────────────────

const MARKET_COLUMNS: &[&str] = &[
    "ticker",
    "title",
    "event_ticker",
    "series_ticker",
    "yes_bid",
    "yes_ask",
    "no_bid",
    "no_ask",
    "last_price",
    "volume",
    "volume_24h",
    "open_interest",
    "open_time",
    "close_time",
    "status",
    "source",
];

impl Record for MarketRecord {
    const KIND: DatasetKind = DatasetKind::Snapshot;

    fn columns() -> &'static [&'static str] {
        MARKET_COLUMNS
    }

    fn partition_key(&self) -> PartitionKey {
        PartitionKey::Whole
    }

    fn order_key(&self) -> Option<i64> {
        None
    }

    fn identity(&self) -> String {
        format!("{}:{}", self.source, self.ticker)
    }

    fn to_frame(records: &[Self]) -> Result<DataFrame, StoreError> {
        let df = DataFrame::new(vec![
            Column::new("ticker".into(), records.iter().map(|r| r.ticker.clone()).collect::<Vec<_>>()),
            Column::new("title".into(), records.iter().map(|r| r.title.clone()).collect::<Vec<_>>()),
            Column::new(
                "event_ticker".into(),
                records.iter().map(|r| r.event_ticker.clone()).collect::<Vec<_>>(),
            ),
            Column::new(
                "series_ticker".into(),
                records.iter().map(|r| r.series_ticker.clone()).collect::<Vec<_>>(),
            ),
            Column::new("yes_bid".into(), ticks(records.iter().map(|r| r.yes_bid))),
            Column::new("yes_ask".into(), ticks(records.iter().map(|r| r.yes_ask))),
            Column::new("no_bid".into(), ticks(records.iter().map(|r| r.no_bid))),
            Column::new("no_ask".into(), ticks(records.iter().map(|r| r.no_ask))),
            Column::new("last_price".into(), ticks(records.iter().map(|r| r.last_price))),
            Column::new("volume".into(), records.iter().map(|r| r.volume).collect::<Vec<_>>()),
            Column::new(
                "volume_24h".into(),
                records.iter().map(|r| r.volume_24h).collect::<Vec<_>>(),
            ),
            Column::new(
                "open_interest".into(),
                records.iter().map(|r| r.open_interest).collect::<Vec<_>>(),
            ),
            Column::new(
                "open_time".into(),
                records.iter().map(|r| r.open_time.timestamp_millis()).collect::<Vec<_>>(),
            ),
            Column::new(
                "close_time".into(),
                records.iter().map(|r| r.close_time.timestamp_millis()).collect::<Vec<_>>(),
            ),
            Column::new(
                "status".into(),
                records.iter().map(|r| r.status.as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "source".into(),
                records.iter().map(|r| r.source.as_str()).collect::<Vec<_>>(),
            ),
        ])?;
        Ok(df)
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError> {
        let ticker = required_strings(df, "ticker")?;
        let title = strings(df, "title")?;
        let event = strings(df, "event_ticker")?;
        let series = strings(df, "series_ticker")?;
        let yes_bid = prices(df, "yes_bid")?;
        let yes_ask = prices(df, "yes_ask")?;
        let no_bid = prices(df, "no_bid")?;
        let no_ask = prices(df, "no_ask")?;
        let last = prices(df, "last_price")?;
        let volume = u64s(df, "volume")?;
        let volume_24h = u64s(df, "volume_24h")?;
        let oi = u64s(df, "open_interest")?;
        let open_time = i64s(df, "open_time")?;
        let close_time = i64s(df, "close_time")?;
        let status = required_strings(df, "status")?;
        let source = required_strings(df, "source")?;

        (0..df.height())
            .map(|i| {
                Ok(MarketRecord {
                    ticker: ticker[i].clone(),
                    title: title[i].clone().unwrap_or_default(),
                    event_ticker: event[i].clone().unwrap_or_default(),
                    series_ticker: series[i].clone(),
                    yes_bid: yes_bid[i],
                    yes_ask: yes_ask[i],
                    no_bid: no_bid[i],
                    no_ask: no_ask[i],
                    last_price: last[i],
                    volume: volume[i],
                    volume_24h: volume_24h[i],
                    open_interest: oi[i],
                    open_time: timestamp(open_time[i])?,
                    close_time: timestamp(close_time[i])?,
                    status: status[i]
                        .parse::<MarketStatus>()
                        .map_err(|e| StoreError::Codec(e.to_string()))?,
                    source: source[i]
                        .parse::<DataSource>()
                        .map_err(|e| StoreError::Codec(e.to_string()))?,
                })
            })
            .collect()
    }
}

// ── Candles ─────────────────────────────────────────────────────────

const CANDLE_COLUMNS: &[&str] = &[
    "ticker",
    "granularity",
    "start",
    "open",
    "high",
    "low",
    "close",
    "volume",
];

impl Record for CandleRecord {
    const KIND: DatasetKind = DatasetKind::TimeSeries;

    fn columns() -> &'static [&'static str] {
        CANDLE_COLUMNS
    }

    fn partition_key(&self) -> PartitionKey {
        PartitionKey::series(self.ticker.clone(), self.granularity)
    }

    fn order_key(&self) -> Option<i64> {
        Some(self.start_millis())
    }

    fn identity(&self) -> String {
        self.start_millis().to_string()
    }

    fn to_frame(records: &[Self]) -> Result<DataFrame, StoreError> {
        let df = DataFrame::new(vec![
            Column::new("ticker".into(), records.iter().map(|r| r.ticker.clone()).collect::<Vec<_>>()),
            Column::new(
                "granularity".into(),
                records.iter().map(|r| r.granularity.tag()).collect::<Vec<_>>(),
            ),
            Column::new("start".into(), records.iter().map(|r| r.start_millis()).collect::<Vec<_>>()),
            Column::new("open".into(), ticks(records.iter().map(|r| r.open))),
            Column::new("high".into(), ticks(records.iter().map(|r| r.high))),
            Column::new("low".into(), ticks(records.iter().map(|r| r.low))),
            Column::new("close".into(), ticks(records.iter().map(|r| r.close))),
            Column::new("volume".into(), records.iter().map(|r| r.volume).collect::<Vec<_>>()),
        ])?;
        Ok(df)
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError> {
        let ticker = required_strings(df, "ticker")?;
        let gran = required_strings(df, "granularity")?;
        let start = i64s(df, "start")?;
        let open = prices(df, "open")?;
        let high = prices(df, "high")?;
        let low = prices(df, "low")?;
        let close = prices(df, "close")?;
        let volume = u64s(df, "volume")?;

        (0..df.height())
            .map(|i| {
                Ok(CandleRecord {
                    ticker: ticker[i].clone(),
                    granularity: gran[i]
                        .parse::<Granularity>()
                        .map_err(|e| StoreError::Codec(e.to_string()))?,
                    start: timestamp(start[i])?,
                    open: open[i],
                    high: high[i],
                    low: low[i],
                    close: close[i],
                    volume: volume[i],
                })
            })
            .collect()
    }
}

// ── Series ──────────────────────────────────────────────────────────

const SERIES_COLUMNS: &[&str] = &[
    "series_ticker",
    "title",
    "category",
    "member_count",
    "members_json",
    "source",
];

impl Record for SeriesRecord {
    const KIND: DatasetKind = DatasetKind::Snapshot;

    fn columns() -> &'static [&'static str] {
        SERIES_COLUMNS
    }

    fn partition_key(&self) -> PartitionKey {
        PartitionKey::Whole
    }

    fn order_key(&self) -> Option<i64> {
        None
    }

    fn identity(&self) -> String {
        self.series_ticker.clone()
    }

    fn to_frame(records: &[Self]) -> Result<DataFrame, StoreError> {
        let members = records
            .iter()
            .map(|r| serde_json::to_string(&r.members))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Codec(format!("members: {e}")))?;
        let df = DataFrame::new(vec![
            Column::new(
                "series_ticker".into(),
                records.iter().map(|r| r.series_ticker.clone()).collect::<Vec<_>>(),
            ),
            Column::new("title".into(), records.iter().map(|r| r.title.clone()).collect::<Vec<_>>()),
            Column::new(
                "category".into(),
                records.iter().map(|r| r.category.clone()).collect::<Vec<_>>(),
            ),
            Column::new(
                "member_count".into(),
                records.iter().map(|r| r.members.len() as u32).collect::<Vec<_>>(),
            ),
            Column::new("members_json".into(), members),
            Column::new(
                "source".into(),
                records.iter().map(|r| r.source.as_str()).collect::<Vec<_>>(),
            ),
        ])?;
        Ok(df)
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError> {
        let ticker = required_strings(df, "series_ticker")?;
        let title = strings(df, "title")?;
        let category = strings(df, "category")?;
        let members = required_strings(df, "members_json")?;
        let source = required_strings(df, "source")?;

        (0..df.height())
            .map(|i| {
                Ok(SeriesRecord {
                    series_ticker: ticker[i].clone(),
                    title: title[i].clone().unwrap_or_default(),
                    category: category[i].clone().unwrap_or_default(),
                    members: serde_json::from_str(&members[i])
                        .map_err(|e| StoreError::Codec(format!("members at row {i}: {e}")))?,
                    source: source[i]
                        .parse::<DataSource>()
                        .map_err(|e| StoreError::Codec(e.to_string()))?,
                })
            })
            .collect()
    }
}
