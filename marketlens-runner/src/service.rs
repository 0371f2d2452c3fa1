//! Consumer-facing facade.
//!
//! `get_dataset` never fails because the network did: it serves the cache,
//! stale or not, and falls back to the built-in dataset when nothing was
//! ever cached. Only storage problems the orchestrator cannot repair by
//! fetching (corruption, schema mismatch) come back as errors.
//!
//! Kalshi and Polymarket snapshots live in separate datasets with one
//! schema; `unified_markets` serves both as one table tagged by venue.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use marketlens_core::client::MarketDataSource;
use marketlens_core::domain::DataSource;
use marketlens_core::query::{views, Predicate, Query, QueryEngine, QueryError, ResultTable};
use marketlens_core::store::{ColumnarStore, StoreError};

use crate::config::{EngineConfig, SchedulerConfig};
use crate::dataset::{DatasetNameError, DatasetSpec};
use crate::fallback::fallback_frame;
use crate::orchestrator::FallbackOrchestrator;
use crate::registry::{CacheEntry, CacheRegistry, Freshness, RefreshOutcome};
use crate::scheduler::{RefreshObserver, RefreshScheduler, SchedulerError, SchedulerHandle};
use crate::worker::RefreshWorker;

/// Failures a consumer sees. Upstream failures are never among them.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    UnknownDataset(#[from] DatasetNameError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("cannot start background refresh: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ServiceError {
    /// Stored data is damaged and was not served.
    pub fn is_corruption(&self) -> bool {
        match self {
            ServiceError::Query(e) => e.is_corruption(),
            ServiceError::Store(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// Where served rows came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowSource {
    Cache,
    BuiltIn,
}

/// Rows of one dataset with the flags a consumer renders next to them.
///
/// `rows` carries every column of the stored schema unless the query
/// selected or aggregated.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetView {
    pub dataset: String,
    pub rows: ResultTable,
    pub freshness: Freshness,
    pub source: RowSource,
    pub last_refresh: Option<DateTime<Utc>>,
    pub warning: Option<String>,
}

/// Cache state of one venue's market snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub source: DataSource,
    pub dataset: String,
    /// An upstream client for this venue is configured.
    pub configured: bool,
    /// A refresh has committed rows that are being served.
    pub available: bool,
    pub markets: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub freshness: Freshness,
    pub warning: Option<String>,
}

/// Market rows of every selected venue, Kalshi first, with each venue's
/// status.
#[derive(Debug, Clone, Serialize)]
pub struct UnifiedMarkets {
    pub rows: ResultTable,
    pub sources: Vec<SourceStatus>,
}

impl UnifiedMarkets {
    /// The least fresh flag among the venues served.
    pub fn freshness(&self) -> Freshness {
        self.sources
            .iter()
            .map(|s| s.freshness)
            .max()
            .unwrap_or(Freshness::Degraded)
    }
}

const MARKET_VENUES: [DataSource; 2] = [DataSource::Kalshi, DataSource::Polymarket];

/// The consumer contract over one store: reads with freshness flags,
/// refresh triggers and freshness reports.
pub struct MarketDataService {
    orchestrator: Arc<FallbackOrchestrator>,
    engine: QueryEngine,
    scheduler: Mutex<Option<SchedulerHandle>>,
    scheduler_config: SchedulerConfig,
    worker: Mutex<Option<RefreshWorker>>,
}

impl MarketDataService {
    /// Open the store under `config.storage` and register every dataset the
    /// configuration names.
    pub fn new(config: EngineConfig, source: Arc<dyn MarketDataSource>) -> Result<Self, ServiceError> {
        let store = Arc::new(ColumnarStore::open(&config.storage)?);
        let registry = Arc::new(CacheRegistry::new());
        Self::with_parts(config, source, store, registry)
    }

    /// Build over an existing store and registry, Kalshi only.
    pub fn with_parts(
        config: EngineConfig,
        source: Arc<dyn MarketDataSource>,
        store: Arc<ColumnarStore>,
        registry: Arc<CacheRegistry>,
    ) -> Result<Self, ServiceError> {
        Self::with_sources(config, source, None, store, registry)
    }

    /// Build over an existing store and registry. With a `polymarket`
    /// source, `polymarket_markets` is registered alongside the configured
    /// datasets.
    pub fn with_sources(
        config: EngineConfig,
        source: Arc<dyn MarketDataSource>,
        polymarket: Option<Arc<dyn MarketDataSource>>,
        store: Arc<ColumnarStore>,
        registry: Arc<CacheRegistry>,
    ) -> Result<Self, ServiceError> {
        let engine = QueryEngine::new(Arc::clone(&store), &config.query)?;
        let mut datasets = config.configured_datasets();
        if polymarket.is_some() && !datasets.contains(&DatasetSpec::PolymarketMarkets) {
            datasets.push(DatasetSpec::PolymarketMarkets);
        }
        let scheduler_config = config.scheduler.clone();
        let mut orchestrator = FallbackOrchestrator::new(source, store, registry, config);
        if let Some(p) = polymarket {
            orchestrator = orchestrator.with_polymarket(p);
        }
        let orchestrator = Arc::new(orchestrator);
        for spec in &datasets {
            orchestrator.register(spec)?;
        }
        Ok(Self {
            orchestrator,
            engine,
            scheduler: Mutex::new(None),
            scheduler_config,
            worker: Mutex::new(None),
        })
    }

    /// The orchestrator behind every refresh this service runs.
    pub fn orchestrator(&self) -> &Arc<FallbackOrchestrator> {
        &self.orchestrator
    }

    /// The registry shared with the orchestrator and scheduler.
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        self.orchestrator.registry()
    }

    /// Start periodic refreshes. A second call is a no-op.
    pub fn start_scheduler(&self, observer: Arc<dyn RefreshObserver>) -> Result<(), ServiceError> {
        let mut slot = self.scheduler.lock();
        if slot.is_none() {
            *slot = Some(RefreshScheduler::spawn(
                Arc::clone(&self.orchestrator),
                &self.scheduler_config,
                observer,
            )?);
        }
        Ok(())
    }

    /// Stop periodic refreshes, waiting for the running tick.
    pub fn stop_scheduler(&self) {
        if let Some(handle) = self.scheduler.lock().take() {
            handle.shutdown();
        }
    }

    /// Rows of `name` matching `filters`, with staleness information.
    pub fn get_dataset(&self, name: &str, filters: &Predicate) -> Result<DatasetView, ServiceError> {
        let spec: DatasetSpec = name.parse()?;
        let query = Query::new([spec.location().dataset]).filter(spec.scope().and(filters.clone()));
        self.serve(&spec, &query)
    }

    /// Ask for a refresh of `name` without waiting for it. With a
    /// scheduler running it is queued there; otherwise it goes to the one
    /// on-demand worker thread, started on first use.
    pub fn trigger_refresh(&self, name: &str) -> Result<(), ServiceError> {
        let spec: DatasetSpec = name.parse()?;
        self.orchestrator.register(&spec)?;
        if let Some(handle) = self.scheduler.lock().as_ref() {
            drop(handle.refresh_now(&spec));
            return Ok(());
        }
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(RefreshWorker::spawn(Arc::clone(&self.orchestrator))?);
        }
        if let Some(w) = worker.as_ref() {
            w.submit(&spec);
        }
        Ok(())
    }

    /// Datasets queued on the on-demand worker and not yet started.
    pub fn pending_refreshes(&self) -> usize {
        self.worker.lock().as_ref().map_or(0, |w| w.pending())
    }

    /// Refresh `name` on the calling thread and return the outcome.
    pub fn refresh(&self, name: &str) -> Result<RefreshOutcome, ServiceError> {
        let spec: DatasetSpec = name.parse()?;
        Ok(self.orchestrator.refresh(&spec))
    }

    /// Freshness of every registered dataset as of now.
    pub fn freshness_report(&self) -> BTreeMap<String, Freshness> {
        let now = Utc::now();
        self.registry()
            .specs()
            .iter()
            .filter_map(|spec| {
                let entry = self.orchestrator.assess(spec).ok()?;
                let threshold = self.orchestrator.policy(spec).staleness;
                Some((entry.dataset.clone(), entry.freshness_at(now, threshold)))
            })
            .collect()
    }

    /// Cache entries of every registered dataset, re-evaluated as of now.
    pub fn cache_entries(&self) -> Vec<CacheEntry> {
        self.registry()
            .specs()
            .iter()
            .filter_map(|spec| self.orchestrator.assess(spec).ok())
            .collect()
    }

    /// 24h volume and market count per series.
    pub fn series_volumes(&self, min_volume: u64) -> Result<DatasetView, ServiceError> {
        self.serve(&DatasetSpec::Markets, &views::series_volumes(min_volume))
    }

    /// Most traded markets over the last 24h.
    pub fn top_markets(&self, limit: usize) -> Result<DatasetView, ServiceError> {
        self.serve(&DatasetSpec::Markets, &views::top_markets(limit))
    }

    /// Market rows of every venue with a configured source, or only of
    /// `source`, matching `filters`. Each venue is served independently:
    /// one can be fresh while the other falls back to built-in rows.
    /// `Some(DataSource::Fallback)` selects the built-in rows of any venue.
    pub fn unified_markets(
        &self,
        source: Option<DataSource>,
        filters: &Predicate,
    ) -> Result<UnifiedMarkets, ServiceError> {
        let mut rows: Option<ResultTable> = None;
        let mut sources = Vec::new();
        for venue in MARKET_VENUES {
            if !self.orchestrator.has_source(venue) {
                continue;
            }
            let Some(spec) = DatasetSpec::markets_of(venue) else {
                continue;
            };
            let matches = match source {
                None | Some(DataSource::Fallback) => true,
                Some(s) => s == venue,
            };
            if !matches {
                continue;
            }
            let mut predicate = spec.scope().and(filters.clone());
            if let Some(s) = source {
                predicate = predicate.and(Predicate::eq("source", s.as_str()));
            }
            let query = Query::new([spec.location().dataset]).filter(predicate);
            let view = self.serve(&spec, &query)?;
            let entry = self.orchestrator.assess(&spec)?;
            sources.push(SourceStatus {
                source: venue,
                dataset: view.dataset.clone(),
                configured: true,
                available: view.source == RowSource::Cache,
                markets: entry.rows,
                last_updated: view.last_refresh,
                freshness: view.freshness,
                warning: view.warning.clone(),
            });
            match rows.as_mut() {
                Some(acc) => acc.rows.extend(view.rows.rows),
                None => rows = Some(view.rows),
            }
        }
        let rows = rows.unwrap_or_default();
        debug!(?source, rows = rows.len(), venues = sources.len(), "served unified markets");
        Ok(UnifiedMarkets { rows, sources })
    }

    /// Per-venue cache state, without reading any rows. A venue with no
    /// configured source reports what the store holds for it.
    pub fn data_source_status(&self) -> Result<Vec<SourceStatus>, ServiceError> {
        let now = Utc::now();
        let mut out = Vec::with_capacity(MARKET_VENUES.len());
        for venue in MARKET_VENUES {
            let Some(spec) = DatasetSpec::markets_of(venue) else {
                continue;
            };
            let configured = self.orchestrator.has_source(venue);
            let threshold = self.orchestrator.policy(&spec).staleness;
            // Unconfigured venues are not registered, so the scheduler
            // never tries to refresh them.
            let entry = if configured {
                self.orchestrator.assess(&spec)?
            } else {
                self.orchestrator.peek(&spec)?
            };
            let freshness = entry.freshness_at(now, threshold);
            let warning = match (configured, freshness) {
                (false, _) => Some(format!("no {venue} source configured")),
                (true, Freshness::Degraded) => Some(format!("no cached data for {spec}")),
                (true, _) => entry.last_error.as_ref().map(|e| e.message.clone()),
            };
            out.push(SourceStatus {
                source: venue,
                dataset: spec.to_string(),
                configured,
                available: entry.has_cache(),
                markets: entry.rows,
                last_updated: entry.last_success,
                freshness,
                warning,
            });
        }
        Ok(out)
    }

    fn serve(&self, spec: &DatasetSpec, query: &Query) -> Result<DatasetView, ServiceError> {
        let entry = self.orchestrator.assess(spec)?;
        let threshold = self.orchestrator.policy(spec).staleness;
        let freshness = entry.freshness_at(Utc::now(), threshold);

        if freshness == Freshness::Degraded {
            self.kick_first_refresh(spec, &entry);
            let frame = fallback_frame(spec)?;
            let rows = self.engine.query_frames(&[frame], query)?;
            let reason = entry
                .last_error
                .as_ref()
                .map_or_else(|| "no refresh has completed".to_string(), |e| e.message.clone());
            warn!(dataset = %spec, %reason, "serving built-in dataset");
            return Ok(DatasetView {
                dataset: spec.to_string(),
                rows,
                freshness,
                source: RowSource::BuiltIn,
                last_refresh: None,
                warning: Some(format!("no cached data for {spec} ({reason}); showing built-in data")),
            });
        }

        let rows = self.engine.query(query)?;
        let warning = (freshness == Freshness::Stale).then(|| match &entry.last_error {
            Some(e) => format!("last refresh of {spec} failed ({}); showing cached data", e.message),
            None => format!("cached data for {spec} is older than {}s", threshold.as_secs()),
        });
        debug!(dataset = %spec, rows = rows.len(), %freshness, "served from cache");
        Ok(DatasetView {
            dataset: spec.to_string(),
            rows,
            freshness,
            source: RowSource::Cache,
            last_refresh: entry.last_success,
            warning,
        })
    }

    /// With a scheduler running, a dataset first read before any refresh
    /// is queued for one.
    fn kick_first_refresh(&self, spec: &DatasetSpec, entry: &CacheEntry) {
        if entry.last_attempt.is_some() || self.registry().in_flight(&entry.dataset) {
            return;
        }
        if let Some(handle) = self.scheduler.lock().as_ref() {
            drop(handle.refresh_now(spec));
        }
    }
}

impl Drop for MarketDataService {
    fn drop(&mut self) {
        self.stop_scheduler();
        if let Some(worker) = self.worker.lock().take() {
            worker.shutdown();
        }
    }
}
