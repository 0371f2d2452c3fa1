//! Store durability: atomic partition writes, reads racing compaction, and
//! detection of tampered files.

use chrono::{Duration, TimeZone, Utc};
use marketlens_core::domain::{CandleRecord, Granularity, Price};
use marketlens_core::store::{ColumnarStore, CompactOptions, PartitionKey, WriteMode};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn candles(ticker: &str, from_hour: i64, n: usize) -> Vec<CandleRecord> {
    let base = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
    (0..n as i64)
        .map(|i| {
            let h = from_hour + i;
            let cents = (h % 90 + 5) as u32;
            CandleRecord {
                ticker: ticker.to_string(),
                start: base + Duration::hours(h),
                open: Some(Price::from_cents(cents).unwrap()),
                high: Some(Price::from_cents(cents + 3).unwrap()),
                low: Some(Price::from_cents(cents - 2).unwrap()),
                close: Some(Price::from_cents(cents + 1).unwrap()),
                volume: 10 + h as u64,
                granularity: Granularity::Hour,
            }
        })
        .collect()
}

fn all(_: &PartitionKey) -> bool {
    true
}

#[test]
fn write_then_read_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let store = ColumnarStore::at(dir.path()).unwrap();
    let mut rows = candles("A", 0, 100);
    rows[40].open = None;
    rows[40].close = None;
    store.write("candles", &rows, WriteMode::Append).unwrap();
    let read: Vec<CandleRecord> = store.read_records("candles", &all).unwrap();
    assert_eq!(read, rows);
}

#[test]
fn lost_staged_write_leaves_partition_intact() {
    let dir = tempfile::tempdir().unwrap();
    let before = candles("A", 0, 24);
    let leaked_tmp;
    {
        let store = ColumnarStore::at(dir.path()).unwrap();
        store.write("candles", &before, WriteMode::Append).unwrap();

        // Crash after the temp file is written but before the rename.
        let staged = store
            .stage("candles", &candles("A", 0, 48), WriteMode::ReplacePartition)
            .unwrap();
        leaked_tmp = staged.staged_paths()[0].to_path_buf();
        std::mem::forget(staged);
        assert!(leaked_tmp.exists());

        let read: Vec<CandleRecord> = store.read_records("candles", &all).unwrap();
        assert_eq!(read, before);
    }

    // The next process sees the prior partition and sweeps the leftover.
    let store = ColumnarStore::at(dir.path()).unwrap();
    let read: Vec<CandleRecord> = store.read_records("candles", &all).unwrap();
    assert_eq!(read, before);
    let report = store
        .compact::<marketlens_core::domain::CandleRecord>("candles", &CompactOptions::default())
        .unwrap();
    assert_eq!(report.orphans_removed, 1);
    assert!(!leaked_tmp.exists());
    assert_eq!(store.read_records::<CandleRecord>("candles", &all).unwrap(), before);
}

#[test]
fn readers_never_see_half_compacted_state() {
    const CHUNK: usize = 6;
    const CHUNKS: usize = 30;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ColumnarStore::at(dir.path()).unwrap());
    store.write("candles", &candles("A", 0, CHUNK), WriteMode::Append).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for c in 1..CHUNKS {
                let rows = candles("A", (c * CHUNK) as i64, CHUNK);
                store.write("candles", &rows, WriteMode::Append).unwrap();
            }
        })
    };
    let compactor = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                store
                    .compact::<CandleRecord>("candles", &CompactOptions::default())
                    .unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0usize;
                while !done.load(Ordering::SeqCst) || reads == 0 {
                    let read: Vec<CandleRecord> = store.read_records("candles", &all).unwrap();
                    // Always a whole number of committed writes, in order.
                    assert_eq!(read.len() % CHUNK, 0);
                    assert_eq!(read, candles("A", 0, read.len()));
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    writer.join().unwrap();
    done.store(true, Ordering::SeqCst);
    compactor.join().unwrap();
    for r in readers {
        assert!(r.join().unwrap() > 0);
    }

    store
        .compact::<CandleRecord>("candles", &CompactOptions::default())
        .unwrap();
    let read: Vec<CandleRecord> = store.read_records("candles", &all).unwrap();
    assert_eq!(read, candles("A", 0, CHUNK * CHUNKS));
    assert_eq!(store.manifest("candles").unwrap().unwrap().files(), 1);
    assert!(store.verify("candles").unwrap().is_clean());
}

#[test]
fn tampered_file_is_reported_with_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let store = ColumnarStore::at(dir.path()).unwrap();
    store.write("candles", &candles("A", 0, 30), WriteMode::Append).unwrap();
    store.write("candles", &candles("B", 0, 30), WriteMode::Append).unwrap();

    let manifest = store.manifest("candles").unwrap().unwrap();
    let seg = &manifest.partitions["B_1h"].segments[0];
    let path = store.dataset_dir("candles").join(&seg.file);
    let len = fs::metadata(&path).unwrap().len() as usize;
    fs::write(&path, vec![0u8; len]).unwrap();

    let verify = store.verify("candles").unwrap();
    assert_eq!(verify.files_checked, 2);
    assert_eq!(verify.problems.len(), 1);
    assert_eq!(verify.problems[0].path, path);

    let err = store.read_records::<CandleRecord>("candles", &all).unwrap_err();
    assert!(err.is_corruption(), "{err}");
    assert!(err.to_string().contains("B_1h"), "{err}");

    // The untouched partition stays readable on its own.
    let a: Vec<CandleRecord> = store
        .read_records("candles", &|k| k.entity() == Some("A"))
        .unwrap();
    assert_eq!(a.len(), 30);
}
