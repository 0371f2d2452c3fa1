//! Fetch-or-fallback decisions per dataset.
//!
//! A refresh moves a dataset to `Fetching`, pulls from the upstream source
//! and commits to the store. Success ends in `Fresh`. Failure ends in
//! `Stale` when an earlier refresh succeeded (the last good cache keeps
//! being served) and in `Degraded` when nothing was ever cached (the
//! built-in dataset is served). Errors end up on the cache entry; they are
//! never returned to the caller.
//!
//! A refresh that succeeds without anything committed to the store (a new
//! market with no completed candle yet) leaves the dataset `Degraded`, the
//! same state a restart would hydrate it to.
//!
//! Refreshes of one dataset are single-flight: a caller that arrives while
//! a refresh runs waits for that refresh's outcome instead of fetching
//! again. Readers never wait; they are served whatever is committed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use marketlens_core::client::{
    CandleRequest, FetchError, MarketDataSource, MarketQuery, SeriesQuery,
};
use marketlens_core::domain::{DataSource, Granularity, MarketRecord};
use marketlens_core::store::{ColumnarStore, StoreError, WriteMode};

use crate::config::{DatasetPolicy, EngineConfig};
use crate::dataset::DatasetSpec;
use crate::registry::{
    CacheEntry, CacheRegistry, DatasetSlot, DatasetState, Flight, LastError, RefreshOutcome,
    Staleness,
};

/// Why a refresh attempt failed.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot place a {granularity} window at {at}")]
    Window { granularity: Granularity, at: i64 },

    #[error("no {venue} source is configured for {dataset}")]
    Unconfigured { dataset: String, venue: DataSource },
}

impl RefreshError {
    pub fn kind(&self) -> &'static str {
        match self {
            RefreshError::Fetch(e) => e.kind(),
            RefreshError::Store(e) if e.is_corruption() => "storage_corruption",
            RefreshError::Store(_) => "storage",
            RefreshError::Window { .. } => "window",
            RefreshError::Unconfigured { .. } => "unconfigured",
        }
    }

    fn record(&self, at: DateTime<Utc>) -> LastError {
        LastError {
            kind: self.kind().to_string(),
            message: self.to_string(),
            at,
        }
    }
}

pub struct FallbackOrchestrator {
    source: Arc<dyn MarketDataSource>,
    polymarket: Option<Arc<dyn MarketDataSource>>,
    store: Arc<ColumnarStore>,
    registry: Arc<CacheRegistry>,
    config: EngineConfig,
}

impl FallbackOrchestrator {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        store: Arc<ColumnarStore>,
        registry: Arc<CacheRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            polymarket: None,
            store,
            registry,
            config,
        }
    }

    /// Serve `polymarket_markets` from `source`. Without one, refreshes of
    /// that dataset fail as `unconfigured`.
    pub fn with_polymarket(mut self, source: Arc<dyn MarketDataSource>) -> Self {
        self.polymarket = Some(source);
        self
    }

    /// The store every refresh commits to.
    pub fn store(&self) -> &Arc<ColumnarStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Name of the primary (Kalshi) source.
    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Whether refreshes of `origin`'s market dataset reach an upstream.
    pub fn has_source(&self, origin: DataSource) -> bool {
        match origin {
            DataSource::Kalshi => true,
            DataSource::Polymarket => self.polymarket.is_some(),
            DataSource::Fallback => false,
        }
    }

    /// Effective policy of `spec` under the engine configuration.
    pub fn policy(&self, spec: &DatasetSpec) -> DatasetPolicy {
        self.config.policy_for(spec)
    }

    /// Register `spec`, hydrating its entry from the store on first touch.
    pub fn register(&self, spec: &DatasetSpec) -> Result<CacheEntry, StoreError> {
        let slot = self.slot(spec)?;
        let entry = slot.entry.lock().clone();
        Ok(entry)
    }

    /// Re-evaluate staleness of `spec` against its threshold and return the
    /// entry as of now.
    pub fn assess(&self, spec: &DatasetSpec) -> Result<CacheEntry, StoreError> {
        let slot = self.slot(spec)?;
        Ok(self.assess_slot(&slot))
    }

    /// Entry of `spec` as of now, hydrated from the store but not
    /// registered when it is not in the registry yet.
    pub fn peek(&self, spec: &DatasetSpec) -> Result<CacheEntry, StoreError> {
        match self.registry.slot(&spec.to_string()) {
            Some(slot) => Ok(self.assess_slot(&slot)),
            None => self.hydrate(spec),
        }
    }

    /// Run one refresh of `spec`, or wait for the one already running.
    pub fn refresh(&self, spec: &DatasetSpec) -> RefreshOutcome {
        let slot = match self.slot(spec) {
            Ok(slot) => slot,
            Err(e) => {
                error!(dataset = %spec, error = %e, "cannot load cache metadata");
                let e = RefreshError::from(e);
                return RefreshOutcome {
                    dataset: spec.to_string(),
                    state: DatasetState::Degraded,
                    rows_written: 0,
                    error: Some(e.record(Utc::now())),
                    coalesced: false,
                };
            }
        };

        let joined = {
            let mut current = slot.flight.lock();
            match current.clone() {
                Some(flight) => Err(flight),
                None => {
                    let flight = Arc::new(Flight::new());
                    *current = Some(Arc::clone(&flight));
                    Ok(flight)
                }
            }
        };
        let flight = match joined {
            Ok(flight) => flight,
            Err(running) => {
                debug!(dataset = %spec, "joining in-flight refresh");
                return running.wait();
            }
        };

        let guard = FlightGuard {
            slot: &slot,
            flight,
            finished: false,
        };
        let policy = self.policy(spec);
        {
            let mut entry = slot.entry.lock();
            transition(&mut entry, DatasetState::Fetching);
            entry.last_attempt = Some(Utc::now());
        }

        let started = Instant::now();
        let result = self.fetch_and_store(spec, &policy);
        let outcome = self.settle(&slot, &policy, result);
        debug!(
            dataset = %spec,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refresh finished"
        );
        guard.finish(outcome.clone());
        outcome
    }

    fn slot(&self, spec: &DatasetSpec) -> Result<Arc<DatasetSlot>, StoreError> {
        if let Some(slot) = self.registry.slot(&spec.to_string()) {
            return Ok(slot);
        }
        let entry = self.hydrate(spec)?;
        Ok(self.registry.slot_or_insert_with(spec, || entry))
    }

    /// Entry for a dataset not yet in the registry. A committed partition
    /// counts as a prior good cache, written at its last commit.
    fn hydrate(&self, spec: &DatasetSpec) -> Result<CacheEntry, StoreError> {
        let mut entry = CacheEntry::empty(spec);
        let loc = spec.location();
        if let Some(meta) = self.store.partition(loc.dataset, &loc.partition)? {
            entry.last_success = Some(meta.last_write);
            entry.rows = meta.rows();
            entry.staleness = entry.staleness_at(Utc::now(), self.policy(spec).staleness);
            entry.state = match entry.staleness {
                Staleness::Fresh => DatasetState::Fresh,
                _ => DatasetState::Stale,
            };
            debug!(dataset = %spec, rows = entry.rows, last_write = %meta.last_write, "hydrated from store");
        }
        Ok(entry)
    }

    fn assess_slot(&self, slot: &DatasetSlot) -> CacheEntry {
        let threshold = self.policy(&slot.spec).staleness;
        let mut entry = slot.entry.lock();
        entry.staleness = entry.staleness_at(Utc::now(), threshold);
        if entry.state == DatasetState::Fresh && entry.staleness == Staleness::Stale {
            transition(&mut entry, DatasetState::Stale);
        }
        entry.clone()
    }

    fn fetch_and_store(&self, spec: &DatasetSpec, policy: &DatasetPolicy) -> Result<u64, RefreshError> {
        let loc = spec.location();
        match spec {
            DatasetSpec::Markets => {
                let records = self.source.fetch_markets(&MarketQuery {
                    status: policy.market_status.clone(),
                    min_volume: policy.min_volume,
                    series_ticker: None,
                    enrich_series: true,
                    budget: policy.fetch_budget,
                })?;
                self.store.write(loc.dataset, &records, WriteMode::ReplacePartition)?;
                self.track_candles(&records, policy);
                Ok(records.len() as u64)
            }
            DatasetSpec::PolymarketMarkets => {
                let source = self.polymarket.as_ref().ok_or_else(|| RefreshError::Unconfigured {
                    dataset: spec.to_string(),
                    venue: DataSource::Polymarket,
                })?;
                let records = source.fetch_markets(&MarketQuery {
                    status: policy.market_status.clone(),
                    min_volume: policy.min_volume,
                    series_ticker: None,
                    enrich_series: false,
                    budget: policy.fetch_budget,
                })?;
                self.store.write(loc.dataset, &records, WriteMode::ReplacePartition)?;
                Ok(records.len() as u64)
            }
            DatasetSpec::Series => {
                let records = self.source.fetch_series(&SeriesQuery {
                    category: None,
                    with_members: true,
                    budget: policy.fetch_budget,
                })?;
                self.store.write(loc.dataset, &records, WriteMode::ReplacePartition)?;
                Ok(records.len() as u64)
            }
            DatasetSpec::Candles {
                ticker,
                granularity,
            } => {
                let stored = self.store.partition(loc.dataset, &loc.partition)?;
                let now = Utc::now();
                let end = align(now, *granularity)?;
                let start = match stored.as_ref().and_then(|m| m.max_order()) {
                    Some(last_ms) => {
                        let last = DateTime::from_timestamp_millis(last_ms).ok_or(RefreshError::Window {
                            granularity: *granularity,
                            at: last_ms,
                        })?;
                        last + granularity.period()
                    }
                    None => {
                        let lookback = ChronoDuration::from_std(policy.lookback)
                            .unwrap_or_else(|_| ChronoDuration::days(30));
                        align(now - lookback, *granularity)?
                    }
                };
                if start >= end {
                    debug!(dataset = %spec, %start, "no completed interval since last refresh");
                    return Ok(0);
                }
                let candles = self.source.fetch_candles(&CandleRequest {
                    ticker: ticker.clone(),
                    series_ticker: None,
                    granularity: *granularity,
                    start,
                    end,
                    budget: policy.fetch_budget,
                })?;
                if candles.is_empty() {
                    return Ok(0);
                }
                self.store.write(loc.dataset, &candles, WriteMode::Append)?;
                Ok(candles.len() as u64)
            }
        }
    }

    /// Register hourly candle datasets for the `policy.track_candles` most
    /// traded markets at or above `policy.min_volume`. Registration only
    /// hydrates an entry; the scheduler refreshes it on its next tick.
    fn track_candles(&self, records: &[MarketRecord], policy: &DatasetPolicy) {
        if policy.track_candles == 0 {
            return;
        }
        let mut ranked: Vec<&MarketRecord> = records
            .iter()
            .filter(|m| m.volume_24h >= policy.min_volume)
            .collect();
        ranked.sort_by(|a, b| b.volume_24h.cmp(&a.volume_24h).then_with(|| a.ticker.cmp(&b.ticker)));
        let mut added = 0usize;
        for m in ranked.into_iter().take(policy.track_candles) {
            let spec = DatasetSpec::candles(m.ticker.as_str(), Granularity::Hour);
            if self.registry.contains(&spec.to_string()) {
                continue;
            }
            match self.register(&spec) {
                Ok(_) => added += 1,
                Err(e) => warn!(dataset = %spec, error = %e, "cannot track candles"),
            }
        }
        if added > 0 {
            info!(added, min_volume = policy.min_volume, "candle datasets registered");
        }
    }

    fn settle(
        &self,
        slot: &DatasetSlot,
        policy: &DatasetPolicy,
        result: Result<u64, RefreshError>,
    ) -> RefreshOutcome {
        let now = Utc::now();
        let dataset = slot.spec.to_string();
        let loc = slot.spec.location();
        // Row count as committed, read before taking the entry lock. The
        // outer `None` means the store could not be read.
        let committed = match &result {
            Ok(_) => self
                .store
                .partition(loc.dataset, &loc.partition)
                .ok()
                .map(|meta| meta.map(|m| m.rows())),
            Err(_) => None,
        };

        let mut entry = slot.entry.lock();
        match result {
            Ok(written) if committed == Some(None) => {
                // Nothing on disk to serve or to hydrate from after a restart.
                entry.last_success = None;
                entry.last_error = None;
                entry.consecutive_failures = 0;
                entry.rows = 0;
                entry.staleness = Staleness::Unknown;
                transition(&mut entry, DatasetState::Degraded);
                info!(dataset = %dataset, written, "refresh succeeded with nothing to cache");
                RefreshOutcome {
                    dataset,
                    state: DatasetState::Degraded,
                    rows_written: written,
                    error: None,
                    coalesced: false,
                }
            }
            Ok(written) => {
                entry.last_success = Some(now);
                entry.last_error = None;
                entry.consecutive_failures = 0;
                entry.rows = committed.flatten().unwrap_or(entry.rows + written);
                entry.staleness = Staleness::Fresh;
                transition(&mut entry, DatasetState::Fresh);
                info!(dataset = %dataset, written, rows = entry.rows, "refresh succeeded");
                RefreshOutcome {
                    dataset,
                    state: DatasetState::Fresh,
                    rows_written: written,
                    error: None,
                    coalesced: false,
                }
            }
            Err(e) => {
                let record = e.record(now);
                entry.last_error = Some(record.clone());
                entry.consecutive_failures += 1;
                let next = if entry.has_cache() {
                    entry.staleness = Staleness::Stale;
                    DatasetState::Stale
                } else {
                    entry.staleness = Staleness::Unknown;
                    DatasetState::Degraded
                };
                transition(&mut entry, next);
                let serving = if next == DatasetState::Stale { "cache" } else { "fallback" };
                warn!(
                    dataset = %dataset,
                    kind = record.kind.as_str(),
                    failures = entry.consecutive_failures,
                    serving,
                    threshold_secs = policy.staleness.as_secs(),
                    error = %e,
                    "refresh failed"
                );
                RefreshOutcome {
                    dataset,
                    state: next,
                    rows_written: 0,
                    error: Some(record),
                    coalesced: false,
                }
            }
        }
    }
}

/// Start of the interval containing `t`.
fn align(t: DateTime<Utc>, granularity: Granularity) -> Result<DateTime<Utc>, RefreshError> {
    let p = granularity.period_secs();
    let secs = t.timestamp().div_euclid(p) * p;
    DateTime::from_timestamp(secs, 0).ok_or(RefreshError::Window {
        granularity,
        at: secs,
    })
}

fn transition(entry: &mut CacheEntry, to: DatasetState) {
    if entry.state != to {
        info!(dataset = %entry.dataset, from = ?entry.state, to = ?to, "state transition");
        entry.state = to;
    }
}

/// Clears the slot's flight and wakes its waiters, even when the refresh
/// unwinds.
struct FlightGuard<'a> {
    slot: &'a DatasetSlot,
    flight: Arc<Flight>,
    finished: bool,
}

impl FlightGuard<'_> {
    fn finish(mut self, outcome: RefreshOutcome) {
        self.finished = true;
        self.slot.flight.lock().take();
        self.flight.publish(outcome);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let now = Utc::now();
        let error = LastError {
            kind: "aborted".into(),
            message: "refresh aborted before completion".into(),
            at: now,
        };
        let state = {
            let mut entry = self.slot.entry.lock();
            let next = if entry.has_cache() {
                DatasetState::Stale
            } else {
                DatasetState::Degraded
            };
            entry.last_error = Some(error.clone());
            entry.consecutive_failures += 1;
            transition(&mut entry, next);
            next
        };
        self.slot.flight.lock().take();
        self.flight.publish(RefreshOutcome {
            dataset: self.slot.spec.to_string(),
            state,
            rows_written: 0,
            error: Some(error),
            coalesced: false,
        });
    }
}
