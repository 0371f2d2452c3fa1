//! Column projection is pushed into the Parquet reader.

use marketlens_core::config::QueryConfig;
use marketlens_core::query::{Predicate, Query, QueryEngine, Value};
use marketlens_core::store::{ColumnarStore, DatasetKind, PartitionKey, Record, StoreError, WriteMode};
use polars::prelude::*;
use std::sync::Arc;

/// Three-column record: ticker, volume, price.
#[derive(Debug, Clone, PartialEq)]
struct Quote {
    ticker: String,
    volume: u64,
    price: u32,
}

impl Record for Quote {
    const KIND: DatasetKind = DatasetKind::Snapshot;

    fn columns() -> &'static [&'static str] {
        &["ticker", "volume", "price"]
    }

    fn partition_key(&self) -> PartitionKey {
        PartitionKey::Whole
    }

    fn order_key(&self) -> Option<i64> {
        None
    }

    fn identity(&self) -> String {
        self.ticker.clone()
    }

    fn to_frame(records: &[Self]) -> Result<DataFrame, StoreError> {
        Ok(DataFrame::new(vec![
            Column::new("ticker".into(), records.iter().map(|r| r.ticker.clone()).collect::<Vec<_>>()),
            Column::new("volume".into(), records.iter().map(|r| r.volume).collect::<Vec<_>>()),
            Column::new("price".into(), records.iter().map(|r| r.price).collect::<Vec<_>>()),
        ])?)
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, StoreError> {
        let codec = |e: PolarsError| StoreError::Codec(e.to_string());
        let ticker = df.column("ticker").map_err(codec)?.str().map_err(codec)?;
        let volume = df.column("volume").map_err(codec)?.u64().map_err(codec)?;
        let price = df.column("price").map_err(codec)?.u32().map_err(codec)?;
        Ok(ticker
            .into_iter()
            .zip(volume)
            .zip(price)
            .map(|((t, v), p)| Quote {
                ticker: t.unwrap_or_default().to_string(),
                volume: v.unwrap_or_default(),
                price: p.unwrap_or_default(),
            })
            .collect())
    }
}

fn engine() -> (tempfile::TempDir, QueryEngine) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ColumnarStore::at(dir.path()).unwrap());
    let quotes: Vec<Quote> = (0..50)
        .map(|i| Quote {
            ticker: format!("T{i:02}"),
            volume: i * 7,
            price: 100 * (i as u32 % 100),
        })
        .collect();
    store.write("quotes", &quotes, WriteMode::ReplacePartition).unwrap();
    let engine = QueryEngine::new(store, &QueryConfig::default()).unwrap();
    (dir, engine)
}

#[test]
fn projected_query_never_reads_price() {
    let (_d, engine) = engine();
    engine.store().reset_read_stats();

    let table = engine
        .query(&Query::new(["quotes"]).select(["ticker", "volume"]))
        .unwrap();

    assert_eq!(table.columns, vec!["ticker", "volume"]);
    assert_eq!(table.len(), 50);
    assert_eq!(table.get(3, "volume"), Some(&Value::UInt(21)));
    assert!(table.rows.iter().all(|r| r.len() == 2));

    let stats = engine.store().read_stats();
    assert!(stats.column_was_read("ticker"));
    assert!(stats.column_was_read("volume"));
    assert!(!stats.column_was_read("price"));
}

#[test]
fn predicate_columns_are_read_but_not_returned() {
    let (_d, engine) = engine();
    engine.store().reset_read_stats();

    let q = Query::new(["quotes"])
        .filter(Predicate::ge("price", 4000u32))
        .select(["ticker"]);
    let table = engine.query(&q).unwrap();
    assert_eq!(table.columns, vec!["ticker"]);
    assert_eq!(table.len(), 10);

    let stats = engine.store().read_stats();
    assert!(stats.column_was_read("price"));
    assert!(!stats.column_was_read("volume"));
}

#[test]
fn unprojected_query_reads_everything() {
    let (_d, engine) = engine();
    engine.store().reset_read_stats();
    let table = engine.query(&Query::new(["quotes"]).limit(1)).unwrap();
    assert_eq!(table.columns, vec!["ticker", "volume", "price"]);
    let stats = engine.store().read_stats();
    assert!(stats.column_was_read("price"));
}

#[test]
fn decoded_columns_are_exactly_the_projection() {
    let (_d, engine) = engine();
    engine.store().reset_read_stats();
    engine
        .query(&Query::new(["quotes"]).select(["volume", "ticker"]))
        .unwrap();
    let stats = engine.store().read_stats();
    let decoded: Vec<(&str, u64)> = stats
        .columns_read
        .iter()
        .map(|(c, n)| (c.as_str(), *n))
        .collect();
    assert_eq!(decoded, [("ticker", 1), ("volume", 1)]);
    assert_eq!(stats.rows_read, 50);
}
