//! Fetch, stale-cache and built-in fallback paths through the service.

mod common;

use chrono::{Duration, Utc};
use proptest::prelude::*;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use marketlens_core::client::{
    CircuitBreaker, Credentials, HttpResponse, KalshiApi, RateLimitedClient, RetryPolicy,
    Transport, TransportError,
};
use marketlens_core::config::ClientConfig;
use marketlens_core::domain::Granularity;
use marketlens_core::query::{Predicate, Value};
use marketlens_core::store::{ColumnarStore, Manifest, PartitionKey, WriteMode};
use marketlens_runner::fallback::seed_markets;
use marketlens_runner::{DatasetSpec, DatasetState, EngineConfig, Freshness, RowSource};

/// Answers every request with the same status.
struct StatusUpstream {
    status: u16,
    calls: Arc<AtomicUsize>,
}

impl Transport for StatusUpstream {
    fn get(
        &self,
        _path: &str,
        _query: &[(String, String)],
        _headers: &[(String, String)],
        _timeout: std::time::Duration,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HttpResponse::status(self.status))
    }
}

fn kalshi(status: u16) -> (Arc<KalshiApi>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = ClientConfig {
        requests_per_second: 0.0,
        ..ClientConfig::default()
    };
    let upstream = StatusUpstream {
        status,
        calls: Arc::clone(&calls),
    };
    let client = RateLimitedClient::with_transport(&config, Credentials::Anonymous, Box::new(upstream))
        .with_retry_policy(RetryPolicy {
            max_retries: 5,
            ..RetryPolicy::none()
        })
        .with_circuit_breaker(CircuitBreaker::disabled());
    (Arc::new(KalshiApi::new(client)), calls)
}

fn temp_store() -> (tempfile::TempDir, Arc<ColumnarStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ColumnarStore::at(dir.path()).unwrap());
    (dir, store)
}

/// Pretend the partition was last written `by` ago.
fn age_partition(store: &ColumnarStore, dataset: &str, key: &PartitionKey, by: Duration) {
    let dir = store.dataset_dir(dataset);
    let mut manifest = Manifest::load(&dir).unwrap().unwrap();
    let meta = manifest.partitions.get_mut(&key.name(dataset)).unwrap();
    meta.last_write = Utc::now() - by;
    manifest.store(&dir).unwrap();
}

#[test]
fn auth_failure_without_cache_serves_built_in_markets() {
    let (_dir, store) = temp_store();
    let (api, calls) = kalshi(401);
    let service = service_over(&store, api, EngineConfig::default());

    let outcome = service.refresh("markets").unwrap();
    assert_eq!(outcome.state, DatasetState::Degraded);
    assert_eq!(outcome.error.as_ref().unwrap().kind, "permanent");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "auth failures are not retried");

    let view = service.get_dataset("markets", &Predicate::True).unwrap();
    assert_eq!(view.freshness, Freshness::Degraded);
    assert_eq!(view.source, RowSource::BuiltIn);
    assert_eq!(view.rows.len(), seed_markets().len());
    assert!(view.last_refresh.is_none());
    assert!(view.warning.as_deref().unwrap().contains("built-in"));
    assert!(view
        .rows
        .column("source")
        .unwrap()
        .iter()
        .all(|v| v.as_str() == Some("fallback")));

    assert!(store.manifest("markets").unwrap().is_none(), "fallback rows are never stored");
    assert_eq!(service.freshness_report()["markets"], Freshness::Degraded);
}

#[test]
fn failed_candle_refresh_serves_the_ten_minute_old_cache() {
    let (_dir, store) = temp_store();
    let first = this_hour() - Duration::hours(10);
    store
        .write("candles", &candles("TICK1", first, 5), WriteMode::Append)
        .unwrap();
    let key = PartitionKey::series("TICK1", Granularity::Hour);
    age_partition(&store, "candles", &key, Duration::minutes(10));

    let (api, calls) = kalshi(503);
    let config = EngineConfig::from_toml(
        r#"
        [[datasets]]
        name = "candles:TICK1"
        staleness_secs = 300
        "#,
    )
    .unwrap();
    let service = service_over(&store, api, config);

    let outcome = service.refresh("candles:TICK1").unwrap();
    assert_eq!(outcome.state, DatasetState::Stale);
    assert_eq!(outcome.error.as_ref().unwrap().kind, "transient");
    assert_eq!(calls.load(Ordering::SeqCst), 6, "one attempt plus five retries");

    let view = service.get_dataset("candles:TICK1", &Predicate::True).unwrap();
    assert_eq!(view.freshness, Freshness::Stale);
    assert_eq!(view.source, RowSource::Cache);
    assert_eq!(view.rows.len(), 5);
    assert!(view.warning.as_deref().unwrap().contains("failed"));
    let age = Utc::now() - view.last_refresh.unwrap();
    assert!(age >= Duration::minutes(10) && age < Duration::minutes(11), "{age}");

    let entry = service.registry().entry("candles:TICK1").unwrap();
    assert_eq!(entry.consecutive_failures, 1);
    assert_eq!(entry.rows, 5);
    assert_eq!(entry.last_error.unwrap().kind, "transient");
}

#[test]
fn success_after_failure_clears_the_error() {
    let (_dir, store) = temp_store();
    let source = ScriptedSource::new();
    source.push_markets(Ok(markets()));
    source.push_markets(Err(transient()));
    source.push_markets(Ok(markets()));
    let service = service_over(&store, source.clone(), EngineConfig::default());

    assert_eq!(service.refresh("markets").unwrap().state, DatasetState::Fresh);
    let failed = service.refresh("markets").unwrap();
    assert_eq!(failed.state, DatasetState::Stale);
    assert_eq!(
        service.get_dataset("markets", &Predicate::True).unwrap().freshness,
        Freshness::Stale
    );

    let recovered = service.refresh("markets").unwrap();
    assert!(recovered.succeeded());
    assert_eq!(recovered.rows_written, 3);
    let entry = service.registry().entry("markets").unwrap();
    assert!(entry.last_error.is_none());
    assert_eq!(entry.consecutive_failures, 0);
    let view = service.get_dataset("markets", &Predicate::True).unwrap();
    assert_eq!(view.freshness, Freshness::Fresh);
    assert!(view.warning.is_none());
    assert_eq!(source.market_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn cache_from_an_earlier_process_counts_after_restart() -> anyhow::Result<()> {
    let (_dir, store) = temp_store();
    let source = ScriptedSource::new();
    source.push_markets(Ok(markets()));
    let first = service_over(&store, source, EngineConfig::default());
    assert!(first.refresh("markets")?.succeeded());
    drop(first);

    // New registry over the same store; the upstream is now down.
    let restarted = service_over(&store, ScriptedSource::new(), EngineConfig::default());
    let entry = restarted.orchestrator().assess(&DatasetSpec::Markets)?;
    assert!(entry.has_cache());
    assert_eq!(entry.rows, 3);
    assert_eq!(entry.state, DatasetState::Fresh);

    let outcome = restarted.refresh("markets")?;
    assert_eq!(outcome.state, DatasetState::Stale);
    let view = restarted.get_dataset("markets", &Predicate::True)?;
    assert_eq!(view.source, RowSource::Cache);
    assert_eq!(view.rows.len(), 3);
    Ok(())
}

#[test]
fn empty_first_candle_refresh_stays_degraded_across_restart() -> anyhow::Result<()> {
    let (_dir, store) = temp_store();
    let source = ScriptedSource::new();
    source.push_candles(Ok(Vec::new()));
    let service = service_over(&store, source.clone(), EngineConfig::default());

    let outcome = service.refresh("candles:NEW1")?;
    assert!(outcome.succeeded());
    assert_eq!(outcome.state, DatasetState::Degraded);
    let entry = service.orchestrator().assess(&DatasetSpec::candles("NEW1", Granularity::Hour))?;
    assert!(!entry.has_cache());
    assert!(entry.last_attempt.is_some());
    assert_eq!(entry.consecutive_failures, 0);
    let before = service.get_dataset("candles:NEW1", &Predicate::True)?;
    assert_eq!(before.freshness, Freshness::Degraded);
    assert_eq!(before.source, RowSource::BuiltIn);
    drop(service);

    let restarted = service_over(&store, ScriptedSource::new(), EngineConfig::default());
    let after = restarted.get_dataset("candles:NEW1", &Predicate::True)?;
    assert_eq!(after.freshness, before.freshness);
    assert_eq!(after.source, before.source);

    // The first candle that lands makes it a cache.
    let again = ScriptedSource::new();
    again.push_candles(Ok(candles("NEW1", this_hour() - Duration::hours(3), 2)));
    let service = service_over(&store, again, EngineConfig::default());
    assert_eq!(service.refresh("candles:NEW1")?.state, DatasetState::Fresh);
    let view = service.get_dataset("candles:NEW1", &Predicate::True)?;
    assert_eq!(view.source, RowSource::Cache);
    assert_eq!(view.rows.len(), 2);
    Ok(())
}

#[test]
fn candle_refresh_only_asks_for_new_intervals() {
    let (_dir, store) = temp_store();
    let source = ScriptedSource::new();
    source.push_candles(Ok(candles("TICK1", this_hour() - Duration::hours(5), 3)));
    source.push_candles(Ok(candles("TICK1", this_hour() - Duration::hours(2), 2)));
    let service = service_over(&store, source.clone(), EngineConfig::default());

    let first = service.refresh("candles:TICK1").unwrap();
    assert_eq!(first.rows_written, 3);
    let second = service.refresh("candles:TICK1").unwrap();
    assert!(second.succeeded());

    let requests = source.candle_requests.lock().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].end - requests[0].start, Duration::days(30));
    assert_eq!(requests[0].granularity, Granularity::Hour);
    let last_stored = requests[0].end - Duration::hours(5) + Duration::hours(2);
    assert_eq!(requests[1].start, last_stored + Duration::hours(1));
    assert!(requests[1].end >= requests[0].end);

    let view = service.get_dataset("candles:TICK1", &Predicate::True).unwrap();
    assert_eq!(view.rows.len(), 5);
    assert_eq!(service.registry().entry("candles:TICK1").unwrap().rows, 5);
}

#[test]
fn candle_partitions_are_scoped_per_ticker() {
    let (_dir, store) = temp_store();
    store
        .write("candles", &candles("TICK1", this_hour() - Duration::hours(8), 4), WriteMode::Append)
        .unwrap();
    store
        .write("candles", &candles("TICK2", this_hour() - Duration::hours(8), 6), WriteMode::Append)
        .unwrap();
    let service = service_over(&store, ScriptedSource::new(), EngineConfig::default());

    let one = service.get_dataset("candles:TICK1", &Predicate::True).unwrap();
    let two = service.get_dataset("candles:TICK2", &Predicate::True).unwrap();
    assert_eq!(one.rows.len(), 4);
    assert_eq!(two.rows.len(), 6);
    assert!(one
        .rows
        .column("ticker")
        .unwrap()
        .iter()
        .all(|v| v.as_str() == Some("TICK1")));

    // Never fetched at this granularity.
    let daily = service.get_dataset("candles:TICK1:1d", &Predicate::True).unwrap();
    assert_eq!(daily.source, RowSource::BuiltIn);
    assert!(daily.rows.is_empty());
}

#[test]
fn filters_apply_to_cached_and_built_in_rows() {
    let (_dir, store) = temp_store();
    let source = ScriptedSource::new();
    let service = service_over(&store, source.clone(), EngineConfig::default());

    let seeded = service
        .get_dataset("markets", &Predicate::eq("series_ticker", "KXFED"))
        .unwrap();
    assert_eq!(seeded.source, RowSource::BuiltIn);
    assert_eq!(seeded.rows.len(), 2);

    source.push_markets(Ok(markets()));
    service.refresh("markets").unwrap();
    let cached = service
        .get_dataset("markets", &Predicate::ge("volume_24h", 4_000u64))
        .unwrap();
    assert_eq!(cached.source, RowSource::Cache);
    let mut tickers: Vec<_> = cached
        .rows
        .column("ticker")
        .unwrap()
        .into_iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    tickers.sort();
    assert_eq!(tickers, ["REAL-A", "REAL-C"]);
}

#[test]
fn canned_views_answer_from_either_path() {
    let (_dir, store) = temp_store();
    let source = ScriptedSource::new();
    let service = service_over(&store, source.clone(), EngineConfig::default());

    let seeded = service.top_markets(2).unwrap();
    assert_eq!(seeded.source, RowSource::BuiltIn);
    assert_eq!(seeded.rows.len(), 2);
    assert_eq!(seeded.rows.get(0, "ticker").unwrap().as_str(), Some("KXFED-SEED-HOLD"));

    source.push_markets(Ok(markets()));
    service.refresh("markets").unwrap();

    let volumes = service.series_volumes(0).unwrap();
    assert_eq!(volumes.source, RowSource::Cache);
    assert_eq!(volumes.rows.len(), 2);
    assert_eq!(volumes.rows.get(0, "series_ticker").unwrap().as_str(), Some("KXB"));
    assert_eq!(volumes.rows.get(0, "volume_24h").unwrap().as_u64(), Some(9_000));
    assert_eq!(volumes.rows.get(1, "volume_24h").unwrap().as_u64(), Some(8_000));
    assert_eq!(volumes.rows.get(1, "markets").unwrap().as_u64(), Some(2));

    let top = service.top_markets(1).unwrap();
    assert_eq!(top.rows.len(), 1);
    assert_eq!(top.rows.get(0, "ticker").unwrap().as_str(), Some("REAL-C"));
}

#[test]
fn unknown_dataset_names_are_rejected() {
    let (_dir, store) = temp_store();
    let service = service_over(&store, ScriptedSource::new(), EngineConfig::default());
    assert!(service.get_dataset("orders", &Predicate::True).is_err());
    assert!(service.get_dataset("candles", &Predicate::True).is_err());
    assert!(service.trigger_refresh("candles:T:7m").is_err());
    assert!(service.registry().is_empty());
}

#[test]
fn damaged_cache_is_an_error_not_a_fallback() {
    let (_dir, store) = temp_store();
    let source = ScriptedSource::new();
    source.push_markets(Ok(markets()));
    let service = service_over(&store, source, EngineConfig::default());
    service.refresh("markets").unwrap();

    let manifest = store.manifest("markets").unwrap().unwrap();
    for meta in manifest.partitions.values() {
        for seg in &meta.segments {
            let path = store.dataset_dir("markets").join(&seg.file);
            let len = fs::metadata(&path).unwrap().len() as usize;
            fs::write(&path, vec![0u8; len]).unwrap();
        }
    }

    let err = service.get_dataset("markets", &Predicate::True).unwrap_err();
    assert!(err.is_corruption(), "{err}");
}

#[test]
fn views_serialize_for_consumers() -> anyhow::Result<()> {
    let (_dir, store) = temp_store();
    let service = service_over(&store, ScriptedSource::new(), EngineConfig::default());
    let view = service.get_dataset("series", &Predicate::True)?;
    let json = serde_json::to_value(&view)?;
    assert_eq!(json["freshness"], "degraded");
    assert_eq!(json["source"], "built_in");
    assert_eq!(json["dataset"], "series");
    assert_eq!(json["rows"]["rows"].as_array().map(Vec::len), Some(3));

    let report = serde_json::to_value(service.freshness_report())?;
    assert_eq!(report["series"], "degraded");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn never_degraded_once_a_refresh_succeeded(script in prop::collection::vec(any::<bool>(), 1..10)) {
        let (_dir, store) = temp_store();
        let source = ScriptedSource::new();
        for ok in &script {
            source.push_markets(if *ok { Ok(markets()) } else { Err(transient()) });
        }
        let service = service_over(&store, source.clone(), EngineConfig::default());

        let mut succeeded = false;
        for ok in &script {
            let outcome = service.refresh("markets").unwrap();
            succeeded |= *ok;
            let view = service.get_dataset("markets", &Predicate::True).unwrap();
            if succeeded {
                prop_assert_ne!(outcome.state, DatasetState::Degraded);
                prop_assert_ne!(view.freshness, Freshness::Degraded);
                prop_assert_eq!(view.source, RowSource::Cache);
                prop_assert_eq!(view.rows.len(), 3);
                prop_assert_eq!(view.freshness == Freshness::Fresh, *ok);
            } else {
                prop_assert_eq!(outcome.state, DatasetState::Degraded);
                prop_assert_eq!(view.source, RowSource::BuiltIn);
            }
        }
        prop_assert_eq!(source.market_calls.load(Ordering::SeqCst), script.len());
    }
}
