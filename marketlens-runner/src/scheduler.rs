//! Periodic refresh of registered datasets.
//!
//! A named background thread sleeps until the next dataset is due, then runs
//! every due refresh in parallel on a private rayon pool (never the global
//! one). Refresh failures are outcomes, so one dataset's failure never holds
//! up another's. On-demand refreshes go straight to the pool and push the
//! dataset's next due time back by a full interval.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::dataset::DatasetSpec;
use crate::orchestrator::FallbackOrchestrator;
use crate::registry::{DatasetState, RefreshOutcome};

/// Tick reports kept by the handle.
const REPORT_HISTORY: usize = 64;

/// The scheduler could not be started.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cannot build refresh pool: {0}")]
    Pool(String),

    #[error("cannot spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Summary of one scheduled tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcomes: Vec<RefreshOutcome>,
}

impl TickReport {
    /// Refreshes that recorded no error.
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    /// Failed refreshes that fell back to the last good cache.
    pub fn served_stale(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded() && o.state == DatasetState::Stale)
            .count()
    }

    /// Datasets left serving built-in rows after this tick.
    pub fn degraded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == DatasetState::Degraded)
            .count()
    }

    /// Refreshes that joined one already in flight.
    pub fn coalesced(&self) -> usize {
        self.outcomes.iter().filter(|o| o.coalesced).count()
    }
}

/// Receives refresh results on the scheduler thread. Implementations must
/// return quickly; the next tick waits for them.
pub trait RefreshObserver: Send + Sync {
    fn on_tick(&self, report: &TickReport);

    /// Completion of an on-demand refresh.
    fn on_refresh(&self, _outcome: &RefreshOutcome) {}
}

/// Logs each tick summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl RefreshObserver for LoggingObserver {
    fn on_tick(&self, report: &TickReport) {
        info!(
            tick = report.tick,
            datasets = report.outcomes.len(),
            succeeded = report.succeeded(),
            served_stale = report.served_stale(),
            degraded = report.degraded(),
            coalesced = report.coalesced(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "refresh tick"
        );
    }

    fn on_refresh(&self, outcome: &RefreshOutcome) {
        info!(
            dataset = %outcome.dataset,
            state = ?outcome.state,
            rows = outcome.rows_written,
            coalesced = outcome.coalesced,
            "on-demand refresh"
        );
    }
}

enum Command {
    /// Push the dataset's next due time back by one interval.
    Reschedule(String),
    Shutdown,
}

/// Periodic refresh of every registered, enabled dataset.
pub struct RefreshScheduler;

impl RefreshScheduler {
    /// Start the scheduler thread and its private refresh pool.
    pub fn spawn(
        orchestrator: Arc<FallbackOrchestrator>,
        config: &SchedulerConfig,
        observer: Arc<dyn RefreshObserver>,
    ) -> Result<SchedulerHandle, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads.max(1))
            .thread_name(|i| format!("marketlens-refresh-{i}"))
            .build()
            .map_err(|e| SchedulerError::Pool(e.to_string()))?;
        let pool = Arc::new(pool);
        let reports = Arc::new(Mutex::new(VecDeque::with_capacity(REPORT_HISTORY)));
        let (tx, rx) = mpsc::channel();

        let worker = Worker {
            rx,
            orchestrator: Arc::clone(&orchestrator),
            pool: Arc::clone(&pool),
            observer: Arc::clone(&observer),
            reports: Arc::clone(&reports),
            interval: config.refresh_interval(),
            run_on_start: config.run_on_start,
        };
        let thread = thread::Builder::new()
            .name("marketlens-scheduler".into())
            .spawn(move || worker.run())?;
        info!(
            interval_secs = config.refresh_interval_secs,
            threads = config.threads,
            "scheduler started"
        );

        Ok(SchedulerHandle {
            tx,
            thread: Some(thread),
            orchestrator,
            pool,
            observer,
            reports,
        })
    }
}

/// Owner of a running scheduler. Dropping it stops the scheduler.
pub struct SchedulerHandle {
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    orchestrator: Arc<FallbackOrchestrator>,
    pool: Arc<rayon::ThreadPool>,
    observer: Arc<dyn RefreshObserver>,
    reports: Arc<Mutex<VecDeque<TickReport>>>,
}

impl SchedulerHandle {
    /// Refresh `spec` now, ahead of its next tick. The outcome arrives on
    /// the returned channel; callers that don't care may drop it.
    pub fn refresh_now(&self, spec: &DatasetSpec) -> Receiver<RefreshOutcome> {
        let (done_tx, done_rx) = mpsc::channel();
        // The scheduler may already be gone; the refresh still runs.
        let _ = self.tx.send(Command::Reschedule(spec.to_string()));
        let orchestrator = Arc::clone(&self.orchestrator);
        let observer = Arc::clone(&self.observer);
        let spec = spec.clone();
        self.pool.spawn(move || {
            let outcome = orchestrator.refresh(&spec);
            observer.on_refresh(&outcome);
            let _ = done_tx.send(outcome);
        });
        done_rx
    }

    /// Most recent tick reports, oldest first.
    pub fn recent_reports(&self) -> Vec<TickReport> {
        self.reports.lock().iter().cloned().collect()
    }

    /// The scheduler thread has not exited.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for the current tick to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.tx.send(Command::Shutdown);
        if thread.join().is_err() {
            warn!("scheduler thread panicked");
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    rx: Receiver<Command>,
    orchestrator: Arc<FallbackOrchestrator>,
    pool: Arc<rayon::ThreadPool>,
    observer: Arc<dyn RefreshObserver>,
    reports: Arc<Mutex<VecDeque<TickReport>>>,
    interval: Duration,
    run_on_start: bool,
}

impl Worker {
    fn run(self) {
        let mut due: BTreeMap<String, Instant> = BTreeMap::new();
        let mut first_pass = true;
        let mut tick = 0u64;

        loop {
            let now = Instant::now();
            // Datasets present at start follow `run_on_start`; ones that
            // appear later are due at once.
            let first_due = if first_pass && !self.run_on_start {
                now + self.interval
            } else {
                now
            };
            first_pass = false;
            for name in self.orchestrator.registry().names() {
                due.entry(name).or_insert(first_due);
            }

            let wait = due
                .values()
                .min()
                .map_or(self.interval, |t| t.saturating_duration_since(now));
            match self.rx.recv_timeout(wait) {
                Ok(Command::Reschedule(name)) => {
                    due.insert(name, Instant::now() + self.interval);
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let mut specs = Vec::new();
                    for spec in self.orchestrator.registry().specs() {
                        let name = spec.to_string();
                        if due.get(&name).is_some_and(|t| *t <= now) {
                            due.insert(name, now + self.interval);
                            if self.orchestrator.policy(&spec).enabled {
                                specs.push(spec);
                            }
                        }
                    }
                    if specs.is_empty() {
                        continue;
                    }
                    tick += 1;
                    let report = self.tick(tick, specs);
                    {
                        let mut reports = self.reports.lock();
                        if reports.len() == REPORT_HISTORY {
                            reports.pop_front();
                        }
                        reports.push_back(report.clone());
                    }
                    self.observer.on_tick(&report);
                }
            }
        }
        info!(ticks = tick, "scheduler stopped");
    }

    fn tick(&self, tick: u64, specs: Vec<DatasetSpec>) -> TickReport {
        let started_at = Utc::now();
        let started = Instant::now();
        debug!(tick, datasets = specs.len(), "tick started");
        let orchestrator = &self.orchestrator;
        let outcomes: Vec<RefreshOutcome> = self
            .pool
            .install(|| specs.par_iter().map(|s| orchestrator.refresh(s)).collect());
        TickReport {
            tick,
            started_at,
            elapsed: started.elapsed(),
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LastError;

    fn outcome(state: DatasetState, failed: bool, coalesced: bool) -> RefreshOutcome {
        RefreshOutcome {
            dataset: "markets".into(),
            state,
            rows_written: 0,
            error: failed.then(|| LastError {
                kind: "transient".into(),
                message: "503".into(),
                at: Utc::now(),
            }),
            coalesced,
        }
    }

    #[test]
    fn report_counts() {
        let report = TickReport {
            tick: 1,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            outcomes: vec![
                outcome(DatasetState::Fresh, false, false),
                outcome(DatasetState::Fresh, false, true),
                outcome(DatasetState::Stale, true, false),
                outcome(DatasetState::Degraded, true, false),
            ],
        };
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.served_stale(), 1);
        assert_eq!(report.degraded(), 1);
        assert_eq!(report.coalesced(), 1);
    }
}
