//! Per-dataset cache metadata.
//!
//! The registry is created empty by the embedding process and shared by the
//! orchestrator, the scheduler and the service. Entries appear as datasets
//! are touched and are never removed. Each entry sits behind its own lock;
//! only the orchestrator mutates it.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marketlens_core::store::PartitionKey;

use crate::dataset::DatasetSpec;

/// Cache age relative to the dataset's threshold, as last evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Staleness {
    Fresh,
    Stale,
    /// No refresh has succeeded yet.
    Unknown,
}

/// Orchestrator state of one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    Fresh,
    Stale,
    Fetching,
    Degraded,
}

/// What a consumer is told about the rows it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    /// Cached rows that are older than the threshold or whose last
    /// refresh failed.
    Stale,
    /// Built-in rows; nothing has ever been cached.
    Degraded,
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Degraded => "degraded",
        })
    }
}

/// The most recent refresh failure of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    /// Stable label, e.g. `transient` or `permanent`.
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Cache metadata of one logical dataset.
///
/// `last_success` is set only by a refresh that left rows in the store, or
/// by hydrating a committed partition after a restart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub dataset: String,
    pub store_dataset: String,
    pub partition: PartitionKey,
    pub last_success: Option<DateTime<Utc>>,
    pub staleness: Staleness,
    pub state: DatasetState,
    pub last_error: Option<LastError>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Rows in the cache after the last successful refresh.
    pub rows: u64,
}

impl CacheEntry {
    /// Entry for a dataset with no cache.
    pub fn empty(spec: &DatasetSpec) -> Self {
        let loc = spec.location();
        Self {
            dataset: spec.to_string(),
            store_dataset: loc.dataset.to_string(),
            partition: loc.partition,
            last_success: None,
            staleness: Staleness::Unknown,
            state: DatasetState::Degraded,
            last_error: None,
            last_attempt: None,
            consecutive_failures: 0,
            rows: 0,
        }
    }

    /// A prior good cache exists and is what gets served on failure.
    pub fn has_cache(&self) -> bool {
        self.last_success.is_some()
    }

    /// Time since the last successful refresh; zero if that lies in the
    /// future of `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_success
            .map(|t| (now - t).to_std().unwrap_or(Duration::ZERO))
    }

    /// Staleness at `now` against `threshold`.
    pub fn staleness_at(&self, now: DateTime<Utc>, threshold: Duration) -> Staleness {
        match self.age(now) {
            None => Staleness::Unknown,
            Some(age) if age > threshold => Staleness::Stale,
            Some(_) if self.last_error.is_some() => Staleness::Stale,
            Some(_) => Staleness::Fresh,
        }
    }

    /// The flag served with this dataset's rows at `now`.
    pub fn freshness_at(&self, now: DateTime<Utc>, threshold: Duration) -> Freshness {
        match self.staleness_at(now, threshold) {
            Staleness::Unknown => Freshness::Degraded,
            Staleness::Stale => Freshness::Stale,
            Staleness::Fresh => Freshness::Fresh,
        }
    }
}

/// Outcome of one refresh, shared with every caller that joined it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshOutcome {
    pub dataset: String,
    pub state: DatasetState,
    /// Rows fetched and written by this refresh.
    pub rows_written: u64,
    pub error: Option<LastError>,
    /// The caller waited on a refresh started by someone else.
    pub coalesced: bool,
}

impl RefreshOutcome {
    /// No error was recorded, even if nothing was cached.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A refresh in progress. Later callers wait for its outcome instead of
/// starting their own fetch.
pub(crate) struct Flight {
    outcome: Mutex<Option<RefreshOutcome>>,
    done: Condvar,
    waiters: AtomicUsize,
}

impl Flight {
    pub(crate) fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    pub(crate) fn publish(&self, outcome: RefreshOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    pub(crate) fn wait(&self) -> RefreshOutcome {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.outcome.lock();
        loop {
            if let Some(outcome) = guard.as_ref() {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return RefreshOutcome {
                    coalesced: true,
                    ..outcome.clone()
                };
            }
            self.done.wait(&mut guard);
        }
    }
}

pub(crate) struct DatasetSlot {
    pub(crate) spec: DatasetSpec,
    pub(crate) entry: Mutex<CacheEntry>,
    pub(crate) flight: Mutex<Option<Arc<Flight>>>,
}

/// Cache entries by dataset name.
#[derive(Default)]
pub struct CacheRegistry {
    slots: RwLock<BTreeMap<String, Arc<DatasetSlot>>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered datasets.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Whether `name` (canonical form, e.g. `candles:T`) is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.slots.read().contains_key(name)
    }

    /// Registered dataset names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.slots.read().keys().cloned().collect()
    }

    /// Registered datasets in name order.
    pub fn specs(&self) -> Vec<DatasetSpec> {
        self.slots.read().values().map(|s| s.spec.clone()).collect()
    }

    /// Snapshot of one entry as last written. Staleness is not
    /// re-evaluated; see `FallbackOrchestrator::assess`.
    pub fn entry(&self, name: &str) -> Option<CacheEntry> {
        let slot = self.slots.read().get(name).cloned()?;
        let entry = slot.entry.lock().clone();
        Some(entry)
    }

    /// Snapshots of every entry, in name order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let slots: Vec<Arc<DatasetSlot>> = self.slots.read().values().cloned().collect();
        slots.iter().map(|s| s.entry.lock().clone()).collect()
    }

    /// Whether a refresh of `name` is running.
    pub fn in_flight(&self, name: &str) -> bool {
        self.slot(name).is_some_and(|s| s.flight.lock().is_some())
    }

    /// Callers currently waiting on the running refresh of `name`.
    pub fn waiting(&self, name: &str) -> usize {
        self.slot(name)
            .and_then(|s| s.flight.lock().clone())
            .map_or(0, |f| f.waiters.load(Ordering::SeqCst))
    }

    pub(crate) fn slot(&self, name: &str) -> Option<Arc<DatasetSlot>> {
        self.slots.read().get(name).cloned()
    }

    /// The slot for `spec`, created with `init` on first touch.
    pub(crate) fn slot_or_insert_with(
        &self,
        spec: &DatasetSpec,
        init: impl FnOnce() -> CacheEntry,
    ) -> Arc<DatasetSlot> {
        let name = spec.to_string();
        if let Some(slot) = self.slot(&name) {
            return slot;
        }
        // Build outside the write lock; a racing insert wins.
        let fresh = Arc::new(DatasetSlot {
            spec: spec.clone(),
            entry: Mutex::new(init()),
            flight: Mutex::new(None),
        });
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(name).or_insert(fresh))
    }
}
