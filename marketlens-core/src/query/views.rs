//! Canned market queries.

use super::aggregate::{AggFunc, Aggregation, Measure};
use super::engine::{Query, SortKey};
use super::predicate::Predicate;

pub const MARKETS_DATASET: &str = "markets";

/// 24h volume and market count per series, largest first. Markets without
/// a series are left out.
pub fn series_volumes(min_volume: u64) -> Query {
    let mut predicate = Predicate::NotNull("series_ticker".into());
    if min_volume > 0 {
        predicate = predicate.and(Predicate::ge("volume_24h", min_volume));
    }
    Query::new([MARKETS_DATASET])
        .filter(predicate)
        .aggregate(
            Aggregation::new()
                .group_by(["series_ticker"])
                .measure(Measure::of(AggFunc::Sum, "volume_24h", "volume_24h"))
                .measure(Measure::count("markets"))
                .measure(Measure::of(AggFunc::Sum, "open_interest", "open_interest")),
        )
        .sort_by(SortKey::desc("volume_24h"))
        .sort_by(SortKey::asc("series_ticker"))
}

/// The `limit` most traded markets over the last 24h.
pub fn top_markets(limit: usize) -> Query {
    Query::new([MARKETS_DATASET])
        .select([
            "ticker",
            "title",
            "series_ticker",
            "yes_bid",
            "yes_ask",
            "last_price",
            "volume_24h",
            "open_interest",
        ])
        .sort_by(SortKey::desc("volume_24h"))
        .sort_by(SortKey::asc("ticker"))
        .limit(limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::domain::market::fixtures::market;
    use crate::domain::MarketRecord;
    use crate::query::{QueryEngine, Value};
    use crate::store::{ColumnarStore, Record};
    use std::sync::Arc;

    fn markets() -> Vec<MarketRecord> {
        let mut rows = vec![market("A1", 100), market("A2", 50), market("B1", 400), market("Z", 999)];
        rows[0].series_ticker = Some("A".into());
        rows[1].series_ticker = Some("A".into());
        rows[2].series_ticker = Some("B".into());
        rows
    }

    fn engine() -> (tempfile::TempDir, QueryEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ColumnarStore::at(dir.path()).unwrap());
        (dir, QueryEngine::new(store, &QueryConfig::default()).unwrap())
    }

    #[test]
    fn series_rollup() {
        let (_d, engine) = engine();
        let frame = MarketRecord::to_frame(&markets()).unwrap();
        let table = engine.query_frames(&[frame], &series_volumes(0)).unwrap();
        assert_eq!(table.columns, vec!["series_ticker", "volume_24h", "markets", "open_interest"]);
        assert_eq!(table.get(0, "series_ticker"), Some(&Value::from("B")));
        assert_eq!(table.get(1, "volume_24h"), Some(&Value::Int(150)));
        assert_eq!(table.get(1, "markets"), Some(&Value::UInt(2)));
    }

    #[test]
    fn rollup_min_volume_filters_markets() {
        let (_d, engine) = engine();
        let frame = MarketRecord::to_frame(&markets()).unwrap();
        let table = engine.query_frames(&[frame], &series_volumes(60)).unwrap();
        assert_eq!(table.get(1, "volume_24h"), Some(&Value::Int(100)));
        assert_eq!(table.get(1, "markets"), Some(&Value::UInt(1)));
    }

    #[test]
    fn top_by_volume() {
        let (_d, engine) = engine();
        let frame = MarketRecord::to_frame(&markets()).unwrap();
        let table = engine.query_frames(&[frame], &top_markets(2)).unwrap();
        let tickers: Vec<_> = table.column("ticker").unwrap().into_iter().cloned().collect();
        assert_eq!(tickers, vec![Value::from("Z"), Value::from("B1")]);
    }
}
