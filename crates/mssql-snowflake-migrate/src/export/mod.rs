//! Phase 1: stage each source table as a CSV artifact.

use crate::ddl::create_table_ddl;
use crate::error::Result;
use crate::progress::ProgressTracker;
use crate::source::SourceCatalog;
use crate::staging::{remove_artifact, StagingArea};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A table that could not be exported or loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

/// Outcome of one export pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportReport {
    /// Artifacts written in this pass, in catalog order.
    pub exported: Vec<PathBuf>,

    /// Rows written across all exported tables.
    pub rows_exported: u64,

    /// Tables skipped because they are excluded by configuration.
    pub skipped_excluded: usize,

    /// Tables skipped because they were already exported.
    pub skipped_tracked: usize,

    /// Tables whose export failed; they remain untracked.
    pub failed: Vec<TableFailure>,
}

/// Sequential table exporter.
pub struct Exporter {
    source: Arc<dyn SourceCatalog>,
    tracker: ProgressTracker,
    staging: StagingArea,
    excluded: HashSet<String>,
}

impl Exporter {
    pub fn new(
        source: Arc<dyn SourceCatalog>,
        tracker: ProgressTracker,
        staging: StagingArea,
        excluded: HashSet<String>,
    ) -> Self {
        Self {
            source,
            tracker,
            staging,
            excluded,
        }
    }

    /// Export every table not in `excluded` or `skip`.
    ///
    /// A table is recorded in the progress file only after its artifact is
    /// in place; the artifact path is then sent to `sink`, if any. Per-table
    /// failures are collected in the report. Only a failure to list the
    /// catalog aborts the pass.
    pub async fn run(
        &self,
        skip: &HashSet<String>,
        sink: Option<mpsc::Sender<PathBuf>>,
    ) -> Result<ExportReport> {
        let tables = self.source.list_tables().await?;
        info!("Found {} tables in source catalog", tables.len());

        let mut report = ExportReport::default();

        for table in tables {
            if self.excluded.contains(&table) {
                info!("{}: excluded, skipping", table);
                report.skipped_excluded += 1;
                continue;
            }
            if skip.contains(&table) {
                info!("{}: already exported, skipping", table);
                report.skipped_tracked += 1;
                continue;
            }

            match self.export_table(&table).await {
                Ok((path, rows)) => {
                    info!("{}: exported ({} rows)", table, rows);
                    report.rows_exported += rows;
                    report.exported.push(path.clone());

                    if let Some(sink) = &sink {
                        if sink.send(path).await.is_err() {
                            warn!("{}: load queue closed, artifact left for a later load", table);
                        }
                    }
                }
                Err(e) => {
                    error!("{}: export failed - {}", table, e);
                    report.failed.push(TableFailure {
                        table,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Export finished: {} exported, {} excluded, {} already exported, {} failed",
            report.exported.len(),
            report.skipped_excluded,
            report.skipped_tracked,
            report.failed.len()
        );
        Ok(report)
    }

    async fn export_table(&self, table: &str) -> Result<(PathBuf, u64)> {
        let descriptor = self.source.describe_columns(table).await?;
        let ddl = create_table_ddl(&descriptor);
        debug!("{}: {}", table, ddl);

        // Rows go straight to the temporary file; an early return drops the
        // writer, which discards it.
        let mut writer = self
            .staging
            .begin(table, &ddl, &descriptor.column_names())?;
        self.source.stream_rows(&descriptor, &mut writer).await?;
        let (path, rows) = writer.finish()?;

        if let Err(e) = self.tracker.mark_complete(table) {
            // An unrecorded artifact would be loaded now and exported again later.
            if let Err(cleanup) = remove_artifact(&path) {
                warn!("{}: failed to remove unrecorded artifact: {}", table, cleanup);
            }
            return Err(e);
        }

        Ok((path, rows))
    }
}
