//! Migration orchestrator - main workflow coordinator.

use crate::config::Config;
use crate::ddl::create_table_ddl;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{MigrateError, Result};
use crate::export::{ExportReport, Exporter, TableFailure};
use crate::load::{LoadSettings, Loader};
use crate::progress::ProgressTracker;
use crate::source::{MssqlSource, SourceCatalog};
use crate::staging::{table_name, StagingArea};
use crate::target::{DestinationConnector, SnowflakeConnector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceCatalog>,
    connector: Arc<dyn DestinationConnector>,
    workers: usize,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// "completed" when nothing is left over, otherwise "partial".
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run finished.
    pub completed_at: DateTime<Utc>,

    /// Tables exported in this run.
    pub tables_exported: usize,

    /// Tables skipped by exclusion or because they were already exported.
    pub tables_skipped: usize,

    /// Tables whose export failed.
    pub tables_failed_export: usize,

    /// Artifacts loaded and deleted.
    pub artifacts_loaded: usize,

    /// Artifacts left on disk after exhausting retries.
    pub artifacts_failed: usize,

    /// Rows written to staging.
    pub rows_exported: u64,

    /// Rows appended at the destination.
    pub rows_loaded: u64,

    /// Every table left behind, by either phase.
    pub failed_tables: Vec<String>,

    /// Export failures with their errors.
    pub export_failures: Vec<TableFailure>,

    /// Load failures with their last errors.
    pub load_failures: Vec<TableFailure>,
}

impl MigrationResult {
    fn build(
        run_id: String,
        started_at: DateTime<Utc>,
        export: &ExportReport,
        load: &DispatchReport,
    ) -> Self {
        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let load_failures: Vec<TableFailure> = load
            .failed()
            .map(|o| TableFailure {
                table: o.table.clone(),
                error: o.last_error.clone().unwrap_or_default(),
            })
            .collect();

        let mut failed_tables: Vec<String> = export
            .failed
            .iter()
            .chain(load_failures.iter())
            .map(|f| f.table.clone())
            .collect();
        failed_tables.sort();
        failed_tables.dedup();

        let status = if failed_tables.is_empty() {
            "completed"
        } else {
            "partial"
        };

        Self {
            run_id,
            status: status.to_string(),
            duration_seconds,
            started_at,
            completed_at,
            tables_exported: export.exported.len(),
            tables_skipped: export.skipped_excluded + export.skipped_tracked,
            tables_failed_export: export.failed.len(),
            artifacts_loaded: load.succeeded().count(),
            artifacts_failed: load_failures.len(),
            rows_exported: export.rows_exported,
            rows_loaded: load.rows_loaded(),
            failed_tables,
            export_failures: export.failed.clone(),
            load_failures,
        }
    }

    /// True when every table was exported and every artifact loaded.
    pub fn is_complete(&self) -> bool {
        self.failed_tables.is_empty()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A table the next export would stage.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTable {
    pub name: String,
    pub columns: usize,
    pub ddl: String,
}

/// What a run would do, without doing it.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub tables_to_export: Vec<PlannedTable>,
    pub excluded: Vec<String>,
    pub already_exported: Vec<String>,
    pub pending_artifacts: Vec<PathBuf>,
    pub workers: usize,
}

/// Result of a connectivity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

impl Orchestrator {
    /// Create an orchestrator for MSSQL and Snowflake.
    pub async fn new(config: Config) -> Result<Self> {
        let source = MssqlSource::connect(config.source.clone()).await?;
        let connector = SnowflakeConnector::new(config.target.clone());
        Ok(Self::with_components(
            config,
            Arc::new(source),
            Arc::new(connector),
        ))
    }

    /// Create an orchestrator over arbitrary source and destination.
    pub fn with_components(
        config: Config,
        source: Arc<dyn SourceCatalog>,
        connector: Arc<dyn DestinationConnector>,
    ) -> Self {
        let workers = config.migration.get_workers();
        Self {
            config,
            source,
            connector,
            workers,
        }
    }

    /// Override the number of parallel loads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn tracker(&self) -> ProgressTracker {
        ProgressTracker::new(&self.config.migration.progress_file)
    }

    fn staging(&self) -> StagingArea {
        StagingArea::new(&self.config.migration.staging_dir)
    }

    fn excluded(&self) -> HashSet<String> {
        self.config.migration.exclude_tables.iter().cloned().collect()
    }

    fn exporter(&self) -> Exporter {
        Exporter::new(
            self.source.clone(),
            self.tracker(),
            self.staging(),
            self.excluded(),
        )
    }

    fn dispatcher(&self) -> Dispatcher {
        let loader = Loader::new(
            self.connector.clone(),
            LoadSettings::from_config(&self.config.migration),
        );
        Dispatcher::new(Arc::new(loader), self.workers)
    }

    /// Run both phases.
    pub async fn run(&self) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting migration run: {}", run_id);

        let (export, load) = if self.config.migration.overlap_phases {
            self.run_overlapped().await?
        } else {
            info!(
                "Phase 1: Exporting tables to {}",
                self.config.migration.staging_dir.display()
            );
            let export = self.export().await?;
            info!("Phase 2: Loading staged artifacts");
            let load = self.load().await?;
            (export, load)
        };

        let result = MigrationResult::build(run_id, started_at, &export, &load);
        info!(
            "Migration {}: {} exported, {} loaded ({} rows) in {:.1}s",
            result.status,
            result.tables_exported,
            result.artifacts_loaded,
            result.rows_loaded,
            result.duration_seconds
        );
        if !result.is_complete() {
            warn!("Tables left for the next run: {}", result.failed_tables.join(", "));
        }
        Ok(result)
    }

    /// Phase 1 only.
    pub async fn export(&self) -> Result<ExportReport> {
        let tracked = self.tracker().load()?;
        self.exporter().run(&tracked, None).await
    }

    /// Phase 2 only, over every artifact currently staged.
    pub async fn load(&self) -> Result<DispatchReport> {
        let artifacts = self.staging().discover()?;
        info!("Found {} staged artifacts", artifacts.len());
        Ok(self.dispatcher().run_all(artifacts).await)
    }

    /// Load while exporting. Artifacts left by earlier runs go first, and
    /// their tables are not exported again in this run.
    async fn run_overlapped(&self) -> Result<(ExportReport, DispatchReport)> {
        let tracked = self.tracker().load()?;
        let pending = self.staging().discover()?;

        let mut skip = tracked;
        skip.extend(pending.iter().filter_map(|p| table_name(p).ok()));

        info!(
            "Exporting and loading concurrently ({} artifacts already staged)",
            pending.len()
        );

        let (tx, rx) = mpsc::channel(self.workers * 2);
        let dispatcher = self.dispatcher();
        let loads = tokio::spawn(async move { dispatcher.run(rx).await });

        for artifact in pending {
            if tx.send(artifact).await.is_err() {
                break;
            }
        }
        let export = self.exporter().run(&skip, Some(tx)).await;

        let load = loads
            .await
            .map_err(|e| MigrateError::Incomplete(format!("load task failed: {}", e)))?;
        Ok((export?, load))
    }

    /// Dry run: report what would be exported and loaded.
    pub async fn plan(&self) -> Result<MigrationPlan> {
        let tracked = self.tracker().load()?;
        let excluded = self.excluded();

        let mut plan = MigrationPlan {
            tables_to_export: Vec::new(),
            excluded: Vec::new(),
            already_exported: Vec::new(),
            pending_artifacts: self.staging().discover()?,
            workers: self.workers,
        };

        for name in self.source.list_tables().await? {
            if excluded.contains(&name) {
                plan.excluded.push(name);
            } else if tracked.contains(&name) {
                plan.already_exported.push(name);
            } else {
                let table = self.source.describe_columns(&name).await?;
                plan.tables_to_export.push(PlannedTable {
                    name,
                    columns: table.columns.len(),
                    ddl: create_table_ddl(&table),
                });
            }
        }

        Ok(plan)
    }

    /// Check connectivity to both ends.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let started = Instant::now();
        let source = self.source.ping().await;
        let source_latency_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let target = self.ping_destination().await;
        let target_latency_ms = started.elapsed().as_millis() as u64;

        Ok(HealthCheckResult {
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.as_ref().err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.as_ref().err().map(|e| e.to_string()),
            healthy: source.is_ok() && target.is_ok(),
        })
    }

    async fn ping_destination(&self) -> Result<()> {
        let mut session = self.connector.connect().await?;
        let result = session.ping().await;
        if let Err(e) = session.close().await {
            warn!("Failed to close destination session: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{row, stage, FakeDestination, FakeSource};
    use tempfile::TempDir;

    fn config(dir: &TempDir, overlap: bool) -> Config {
        let yaml = format!(
            r#"
source: {{ host: h, database: d, user: u }}
target: {{ account: a, token: t, database: D }}
migration:
  staging_dir: {}
  progress_file: {}
  exclude_tables: [Skipped]
  max_retries: 3
  retry_backoff_secs: 0
  workers: 2
  overlap_phases: {}
"#,
            dir.path().join("staging").display(),
            dir.path().join("exported_tables.txt").display(),
            overlap
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn source() -> FakeSource {
        FakeSource::new()
            .with_table("A", &[("id", "int")], vec![row(&[Some("1")]), row(&[Some("2")])])
            .with_table("Skipped", &[("id", "int")], vec![row(&[Some("9")])])
            .with_table("C", &[("id", "int"), ("v", "float")], vec![row(&[Some("3"), None])])
    }

    #[tokio::test]
    async fn test_run_completes_both_phases() {
        let dir = TempDir::new().unwrap();
        let dest = FakeDestination::new();
        let orch = Orchestrator::with_components(
            config(&dir, false),
            Arc::new(source()),
            Arc::new(dest.clone()),
        );

        let result = orch.run().await.unwrap();

        assert_eq!(result.status, "completed");
        assert!(result.is_complete());
        assert_eq!(result.tables_exported, 2);
        assert_eq!(result.tables_skipped, 1);
        assert_eq!(result.artifacts_loaded, 2);
        assert_eq!(result.rows_loaded, 3);
        assert_eq!(dest.rows("A").unwrap().len(), 2);
        assert!(dest.rows("Skipped").is_none());
        assert!(orch.staging().discover().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_leaves_partial_result() {
        let dir = TempDir::new().unwrap();
        let dest = FakeDestination::new().fail_inserts("C", 3);
        let orch = Orchestrator::with_components(
            config(&dir, false),
            Arc::new(source()),
            Arc::new(dest.clone()),
        );

        let result = orch.run().await.unwrap();

        assert_eq!(result.status, "partial");
        assert_eq!(result.failed_tables, vec!["C"]);
        assert_eq!(result.artifacts_failed, 1);
        assert_eq!(result.load_failures[0].table, "C");
        assert_eq!(
            orch.staging().discover().unwrap(),
            vec![orch.staging().artifact_path("C")]
        );
        assert!(orch.tracker().load().unwrap().contains("C"));
    }

    #[tokio::test]
    async fn test_overlapped_run_loads_everything() {
        let dir = TempDir::new().unwrap();
        let dest = FakeDestination::new();
        let orch = Orchestrator::with_components(
            config(&dir, true),
            Arc::new(source()),
            Arc::new(dest.clone()),
        );

        let result = orch.run().await.unwrap();

        assert!(result.is_complete());
        assert_eq!(result.artifacts_loaded, 2);
        assert_eq!(dest.rows("C").unwrap().len(), 1);
        assert!(orch.staging().discover().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlapped_run_withholds_staged_tables() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, true);

        // Left over from an interrupted run: staged but never recorded.
        let staging = StagingArea::new(&cfg.migration.staging_dir);
        stage(
            &staging,
            "A",
            r#"CREATE TABLE "A" ("id" INTEGER)"#,
            &["id"],
            vec![row(&[Some("1")])],
        )
        .unwrap();

        let source = Arc::new(source());
        let dest = FakeDestination::new();
        let orch = Orchestrator::with_components(cfg, source.clone(), Arc::new(dest.clone()));

        let result = orch.run().await.unwrap();

        assert!(result.is_complete());
        assert_eq!(result.tables_exported, 1);
        assert_eq!(result.artifacts_loaded, 2);
        assert_eq!(dest.rows("A").unwrap().len(), 1);
        assert!(!source.queried().contains(&"A".to_string()));
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_before_loading() {
        let dir = TempDir::new().unwrap();
        let dest = FakeDestination::new();
        let orch = Orchestrator::with_components(
            config(&dir, false),
            Arc::new(source().failing_listing()),
            Arc::new(dest.clone()),
        );

        assert!(orch.run().await.is_err());
        assert_eq!(dest.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_plan_makes_no_changes() {
        let dir = TempDir::new().unwrap();
        let dest = FakeDestination::new();
        let orch = Orchestrator::with_components(
            config(&dir, false),
            Arc::new(source()),
            Arc::new(dest.clone()),
        );

        let plan = orch.plan().await.unwrap();

        let names: Vec<_> = plan.tables_to_export.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);
        assert_eq!(
            plan.tables_to_export[1].ddl,
            r#"CREATE TABLE "C" ("id" INTEGER, "v" FLOAT)"#
        );
        assert_eq!(plan.excluded, vec!["Skipped"]);
        assert_eq!(plan.workers, 2);
        assert!(!dir.path().join("staging").exists());
        assert!(!dir.path().join("exported_tables.txt").exists());
        assert_eq!(dest.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = TempDir::new().unwrap();
        let healthy = Orchestrator::with_components(
            config(&dir, false),
            Arc::new(source()),
            Arc::new(FakeDestination::new()),
        );
        let result = healthy.health_check().await.unwrap();
        assert!(result.healthy);

        let unhealthy = Orchestrator::with_components(
            config(&dir, false),
            Arc::new(source()),
            Arc::new(FakeDestination::new().fail_connects(1)),
        );
        let result = unhealthy.health_check().await.unwrap();
        assert!(!result.healthy);
        assert!(result.source_connected);
        assert!(result.target_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_result_serializes() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::with_components(
            config(&dir, false),
            Arc::new(source()),
            Arc::new(FakeDestination::new()),
        );
        let json = orch.run().await.unwrap().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["tables_exported"], 2);
    }

    #[tokio::test]
    async fn test_partial_result_round_trips_through_json() {
        let dir = TempDir::new().unwrap();
        let orch = Orchestrator::with_components(
            config(&dir, false),
            Arc::new(source().failing_fetch("A")),
            Arc::new(FakeDestination::new().fail_inserts("C", 3)),
        );
        let result = orch.run().await.unwrap();
        let parsed: MigrationResult = serde_json::from_str(&result.to_json().unwrap()).unwrap();

        assert_eq!(parsed.status, "partial");
        assert_eq!(parsed.failed_tables, vec!["A", "C"]);
        assert_eq!(parsed.export_failures, result.export_failures);
        assert_eq!(parsed.export_failures[0].table, "A");
        assert_eq!(parsed.load_failures, result.load_failures);
        assert!(parsed.load_failures[0].error.contains("warehouse suspended"));
    }
}
