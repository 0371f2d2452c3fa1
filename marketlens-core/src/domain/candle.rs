//! Candlestick (OHLCV interval) records.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{Price, ValidationError};

/// Candle interval length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    /// Short tag used in partition names and on the wire (`1m`, `1h`, `1d`).
    pub fn tag(&self) -> &'static str {
        match self {
            Granularity::Minute => "1m",
            Granularity::Hour => "1h",
            Granularity::Day => "1d",
        }
    }

    /// Interval length in minutes (the upstream `period_interval`).
    pub fn period_minutes(&self) -> u32 {
        match self {
            Granularity::Minute => 1,
            Granularity::Hour => 60,
            Granularity::Day => 1440,
        }
    }

    pub fn period_secs(&self) -> i64 {
        self.period_minutes() as i64 * 60
    }

    pub fn period(&self) -> Duration {
        Duration::seconds(self.period_secs())
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Granularity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Granularity::Minute),
            "1h" => Ok(Granularity::Hour),
            "1d" => Ok(Granularity::Day),
            other => Err(ValidationError::UnknownGranularity(other.to_string())),
        }
    }
}

impl From<Granularity> for String {
    fn from(g: Granularity) -> String {
        g.tag().to_string()
    }
}

impl TryFrom<String> for Granularity {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One OHLCV interval for a ticker.
///
/// Price fields are optional: intervals without trades carry no prices, and
/// such gaps are stored as nulls rather than interpolated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub ticker: String,
    /// Interval start (inclusive).
    pub start: DateTime<Utc>,
    pub open: Option<Price>,
    pub high: Option<Price>,
    pub low: Option<Price>,
    pub close: Option<Price>,
    pub volume: u64,
    pub granularity: Granularity,
}

impl CandleRecord {
    /// Interval end (exclusive).
    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.granularity.period()
    }

    /// Interval start as epoch milliseconds (the storage order key).
    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn is_empty_interval(&self) -> bool {
        self.open.is_none() && self.high.is_none() && self.low.is_none() && self.close.is_none()
    }
}

/// Check that a candle sequence for one (ticker, granularity) is strictly
/// ordered and non-overlapping by interval start.
pub fn validate_candle_sequence(candles: &[CandleRecord]) -> Result<(), ValidationError> {
    let Some(first) = candles.first() else {
        return Ok(());
    };
    for pair in candles.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.ticker != first.ticker || next.granularity != first.granularity {
            return Err(ValidationError::MixedCandleSequence {
                expected: format!("{}_{}", first.ticker, first.granularity),
                found: format!("{}_{}", next.ticker, next.granularity),
            });
        }
        if next.start < prev.end() {
            return Err(ValidationError::CandleOrder {
                ticker: next.ticker.clone(),
                at: next.start_millis(),
            });
        }
    }
    Ok(())
}

/// Roll hourly (or finer) candles up into UTC-day candles.
///
/// First open, max high, min low, last close, summed volume. Days with no
/// input candles produce no output; a day whose candles are all empty
/// produces an empty daily interval.
pub fn resample_daily(candles: &[CandleRecord]) -> Vec<CandleRecord> {
    let mut out: Vec<CandleRecord> = Vec::new();
    for c in candles {
        let day = c
            .start
            .duration_trunc(Duration::days(1))
            .unwrap_or(c.start);
        match out.last_mut() {
            Some(d) if d.start == day && d.ticker == c.ticker => {
                if d.open.is_none() {
                    d.open = c.open;
                }
                d.high = max_opt(d.high, c.high);
                d.low = min_opt(d.low, c.low);
                if c.close.is_some() {
                    d.close = c.close;
                }
                d.volume += c.volume;
            }
            _ => out.push(CandleRecord {
                ticker: c.ticker.clone(),
                start: day,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
                granularity: Granularity::Day,
            }),
        }
    }
    out
}

fn max_opt(a: Option<Price>, b: Option<Price>) -> Option<Price> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn min_opt(a: Option<Price>, b: Option<Price>) -> Option<Price> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    /// `n` consecutive hourly candles for `ticker` starting at `start_hour`
    /// hours after 2024-12-01T00:00Z.
    pub fn hourly(ticker: &str, start_hour: i64, n: usize) -> Vec<CandleRecord> {
        let base = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        (0..n as i64)
            .map(|i| {
                let cents = ((start_hour + i) % 90 + 5) as u32;
                CandleRecord {
                    ticker: ticker.to_string(),
                    start: base + Duration::hours(start_hour + i),
                    open: Some(Price::from_cents(cents).unwrap()),
                    high: Some(Price::from_cents(cents + 3).unwrap()),
                    low: Some(Price::from_cents(cents - 2).unwrap()),
                    close: Some(Price::from_cents(cents + 1).unwrap()),
                    volume: 10 + (start_hour + i) as u64,
                    granularity: Granularity::Hour,
                }
            })
            .collect()
    }
}
