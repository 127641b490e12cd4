//! Bounded parallel dispatch of artifacts to the loader.

use crate::load::{LoadOutcome, Loader};
use crate::staging::table_name;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Outcomes of one dispatch run, in completion-collection order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub outcomes: Vec<LoadOutcome>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &LoadOutcome> {
        self.outcomes.iter().filter(|o| o.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &LoadOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    pub fn rows_loaded(&self) -> u64 {
        self.outcomes.iter().map(|o| o.rows_loaded).sum()
    }
}

/// Runs at most `workers` loads at a time.
pub struct Dispatcher {
    loader: Arc<Loader>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(loader: Arc<Loader>, workers: usize) -> Self {
        Self {
            loader,
            workers: workers.max(1),
        }
    }

    /// Load every artifact received on `rx` until the channel closes, then
    /// wait for all loads to finish.
    ///
    /// Each artifact gets its own task holding one permit for its whole
    /// retry sequence. An artifact whose table was already dispatched in
    /// this run is dropped.
    pub async fn run(&self, mut rx: mpsc::Receiver<PathBuf>) -> DispatchReport {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut seen = HashSet::new();
        let mut handles: Vec<(PathBuf, String, JoinHandle<LoadOutcome>)> = Vec::new();

        info!("Loading artifacts with {} workers", self.workers);

        while let Some(artifact) = rx.recv().await {
            let table = table_name(&artifact).unwrap_or_default();
            if !seen.insert(table.clone()) {
                warn!("{}: already dispatched in this run, ignoring {}", table, artifact.display());
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let loader = self.loader.clone();
            let path = artifact.clone();
            let handle = tokio::spawn(async move {
                let outcome = loader.attempt(&path).await;
                drop(permit);
                outcome
            });
            handles.push((artifact, table, handle));
        }

        let mut report = DispatchReport::default();
        for (artifact, table, handle) in handles {
            match handle.await {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    error!("{}: load task panicked - {}", table, e);
                    report.outcomes.push(LoadOutcome::failed(
                        &artifact,
                        table,
                        0,
                        format!("Task panicked: {}", e),
                    ));
                }
            }
        }

        info!(
            "Load finished: {} succeeded, {} failed",
            report.succeeded().count(),
            report.failed().count()
        );
        report
    }

    /// Load a fixed list of artifacts.
    pub async fn run_all(&self, artifacts: Vec<PathBuf>) -> DispatchReport {
        let (tx, rx) = mpsc::channel(artifacts.len().max(1));
        for artifact in artifacts {
            // Capacity covers every artifact, so this never waits.
            if tx.send(artifact).await.is_err() {
                break;
            }
        }
        drop(tx);
        self.run(rx).await
    }
}
