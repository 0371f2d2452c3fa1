//! Criterion benchmarks for the cache read path.
//!
//! Benchmarks:
//! 1. Projected scan over many candle partitions
//! 2. Ticker-pruned scan (one partition opened)
//! 3. Group-by aggregation with percentile
//! 4. Compaction of a fragmented partition

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use marketlens_core::config::QueryConfig;
use marketlens_core::domain::{CandleRecord, Granularity, Price};
use marketlens_core::query::{AggFunc, Aggregation, Measure, Predicate, Query, QueryEngine};
use marketlens_core::store::{ColumnarStore, CompactOptions, WriteMode};

// ── Helpers ──────────────────────────────────────────────────────────

fn make_candles(ticker: &str, from_hour: i64, n: usize) -> Vec<CandleRecord> {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..n as i64)
        .map(|i| {
            let h = from_hour + i;
            let cents = ((h as f64 * 0.05).sin() * 40.0 + 50.0) as u32;
            CandleRecord {
                ticker: ticker.to_string(),
                start: base + Duration::hours(h),
                open: Some(Price::from_cents(cents).unwrap()),
                high: Some(Price::from_cents((cents + 2).min(100)).unwrap()),
                low: Some(Price::from_cents(cents.saturating_sub(2)).unwrap()),
                close: Some(Price::from_cents(cents).unwrap()),
                volume: 100 + (h as u64 % 997),
                granularity: Granularity::Hour,
            }
        })
        .collect()
}

fn make_engine(tickers: usize, hours: usize) -> (tempfile::TempDir, QueryEngine) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ColumnarStore::at(dir.path()).unwrap());
    let mut rows = Vec::with_capacity(tickers * hours);
    for t in 0..tickers {
        rows.extend(make_candles(&format!("T{t:03}"), 0, hours));
    }
    store.write("candles", &rows, WriteMode::Append).unwrap();
    let engine = QueryEngine::new(store, &QueryConfig::default()).unwrap();
    (dir, engine)
}

// ── Benchmarks ───────────────────────────────────────────────────────

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("candle_scan");
    group.sample_size(20);

    for &tickers in &[10, 50] {
        let (_dir, engine) = make_engine(tickers, 720);
        let projected = Query::new(["candles"]).select(["ticker", "close"]);
        group.bench_with_input(BenchmarkId::new("projected", tickers), &tickers, |b, _| {
            b.iter(|| engine.query(black_box(&projected)).unwrap());
        });

        let pruned = Query::new(["candles"])
            .filter(Predicate::eq("ticker", "T005"))
            .select(["start", "close"]);
        group.bench_with_input(BenchmarkId::new("pruned", tickers), &tickers, |b, _| {
            b.iter(|| engine.query(black_box(&pruned)).unwrap());
        });
    }

    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("candle_aggregate");
    group.sample_size(20);
    let (_dir, engine) = make_engine(50, 720);
    let query = Query::new(["candles"]).aggregate(
        Aggregation::new()
            .group_by(["ticker"])
            .measure(Measure::of(AggFunc::Sum, "volume", "volume"))
            .measure(Measure::of(AggFunc::Mean, "close", "mean_close"))
            .measure(Measure::of(AggFunc::Percentile(0.9), "high", "p90_high")),
    );
    group.bench_function("by_ticker_50x720", |b| {
        b.iter(|| engine.query(black_box(&query)).unwrap());
    });
    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");
    group.sample_size(10);
    group.bench_function("fragmented_24_segments", |b| {
        b.iter_with_setup(
            || {
                let dir = tempfile::tempdir().unwrap();
                let store = ColumnarStore::at(dir.path()).unwrap();
                for s in 0..24 {
                    store
                        .write("candles", &make_candles("T", s * 30, 30), WriteMode::Append)
                        .unwrap();
                }
                (dir, store)
            },
            |(_dir, store)| {
                store
                    .compact::<CandleRecord>("candles", &CompactOptions::default())
                    .unwrap()
            },
        );
    });
    group.finish();
}

criterion_group!(benches, bench_scan, bench_aggregate, bench_compaction);
criterion_main!(benches);
