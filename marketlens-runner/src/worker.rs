//! On-demand refresh worker.
//!
//! Without a scheduler, `trigger_refresh` hands datasets to one named
//! background thread over an `mpsc` channel. A dataset already waiting in
//! the queue is not queued twice; one that is being refreshed is coalesced
//! by the orchestrator's single-flight.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

use crate::dataset::DatasetSpec;
use crate::orchestrator::FallbackOrchestrator;

pub const WORKER_THREAD_NAME: &str = "marketlens-refresh";

enum WorkerCommand {
    Refresh(DatasetSpec),
    Shutdown,
}

pub(crate) struct RefreshWorker {
    tx: Sender<WorkerCommand>,
    queued: Arc<Mutex<BTreeSet<String>>>,
    thread: Option<JoinHandle<()>>,
}

impl RefreshWorker {
    pub(crate) fn spawn(orchestrator: Arc<FallbackOrchestrator>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let queued = Arc::new(Mutex::new(BTreeSet::new()));
        let thread = {
            let queued = Arc::clone(&queued);
            thread::Builder::new()
                .name(WORKER_THREAD_NAME.into())
                .spawn(move || worker_loop(rx, orchestrator, queued))?
        };
        debug!("refresh worker started");
        Ok(Self {
            tx,
            queued,
            thread: Some(thread),
        })
    }

    /// Queue a refresh of `spec`. False if it was already waiting or the
    /// worker has stopped.
    pub(crate) fn submit(&self, spec: &DatasetSpec) -> bool {
        let name = spec.to_string();
        if !self.queued.lock().insert(name.clone()) {
            debug!(dataset = %name, "refresh already queued");
            return false;
        }
        if self.tx.send(WorkerCommand::Refresh(spec.clone())).is_err() {
            self.queued.lock().remove(&name);
            return false;
        }
        true
    }

    /// Datasets waiting for the worker.
    pub(crate) fn pending(&self) -> usize {
        self.queued.lock().len()
    }

    /// Finish the refresh in progress, drop the rest of the queue and join.
    pub(crate) fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.queued.lock().clear();
        let _ = self.tx.send(WorkerCommand::Shutdown);
        let _ = thread.join();
    }
}

impl Drop for RefreshWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    rx: Receiver<WorkerCommand>,
    orchestrator: Arc<FallbackOrchestrator>,
    queued: Arc<Mutex<BTreeSet<String>>>,
) {
    let mut refreshed = 0u64;
    loop {
        match rx.recv() {
            Ok(WorkerCommand::Shutdown) | Err(_) => break,
            Ok(WorkerCommand::Refresh(spec)) => {
                let name = spec.to_string();
                // Cleared by shutdown; skip what was queued before it.
                if !queued.lock().remove(&name) {
                    continue;
                }
                let outcome = orchestrator.refresh(&spec);
                refreshed += 1;
                debug!(dataset = %name, state = ?outcome.state, coalesced = outcome.coalesced, "on-demand refresh done");
            }
        }
    }
    info!(refreshed, "refresh worker stopped");
}
