//! Phase 2: load one staged artifact into the destination, with retries.

use crate::config::MigrationConfig;
use crate::error::Result;
use crate::staging::{read_ddl, remove_artifact, table_name, ArtifactReader};
use crate::target::{DestinationConnector, DestinationSession};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Loader tuning.
#[derive(Debug, Clone)]
pub struct LoadSettings {
    /// Rows per insert call.
    pub batch_size: usize,

    /// Total attempts per artifact (at least one is always made).
    pub max_retries: u32,

    /// Sleep between failed attempts.
    pub retry_backoff: Duration,

    /// Run the staged DDL when the destination table is missing.
    pub create_tables: bool,
}

impl LoadSettings {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retries: config.get_max_retries(),
            retry_backoff: config.retry_backoff(),
            create_tables: config.create_tables,
        }
    }
}

/// Result of loading one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    pub artifact: PathBuf,
    pub table: String,
    pub success: bool,
    pub attempts_used: u32,
    pub rows_loaded: u64,
    pub last_error: Option<String>,
}

impl LoadOutcome {
    pub(crate) fn failed(artifact: &Path, table: String, attempts: u32, error: String) -> Self {
        Self {
            artifact: artifact.to_path_buf(),
            table,
            success: false,
            attempts_used: attempts,
            rows_loaded: 0,
            last_error: Some(error),
        }
    }
}

/// Loads artifacts, one fresh destination session per attempt.
pub struct Loader {
    connector: Arc<dyn DestinationConnector>,
    settings: LoadSettings,
}

impl Loader {
    pub fn new(connector: Arc<dyn DestinationConnector>, settings: LoadSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &LoadSettings {
        &self.settings
    }

    /// Load `artifact` into the table named by its file stem.
    ///
    /// On success the artifact and its sidecar are deleted. After the last
    /// failed attempt both are left in place for the next run.
    pub async fn attempt(&self, artifact: &Path) -> LoadOutcome {
        let table = match table_name(artifact) {
            Ok(table) => table,
            Err(e) => {
                error!("{}: {}", artifact.display(), e);
                return LoadOutcome::failed(artifact, String::new(), 0, e.to_string());
            }
        };

        let max_attempts = self.settings.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.load_once(&table, artifact).await {
                Ok(rows) => {
                    info!(
                        "{}: loaded {} rows (attempt {}/{})",
                        table, rows, attempt, max_attempts
                    );
                    // Rows are already committed; a leftover artifact is reloaded next run.
                    if let Err(e) = remove_artifact(artifact) {
                        error!("{}: loaded but failed to delete artifact - {}", table, e);
                    }
                    return LoadOutcome {
                        artifact: artifact.to_path_buf(),
                        table,
                        success: true,
                        attempts_used: attempt,
                        rows_loaded: rows,
                        last_error: None,
                    };
                }
                Err(e) => {
                    warn!(
                        "{}: load attempt {}/{} failed - {}",
                        table, attempt, max_attempts, e
                    );
                    last_error = Some(e.to_string());
                    if attempt < max_attempts && !self.settings.retry_backoff.is_zero() {
                        tokio::time::sleep(self.settings.retry_backoff).await;
                    }
                }
            }
        }

        error!(
            "{}: giving up after {} attempts, artifact kept at {}",
            table,
            max_attempts,
            artifact.display()
        );
        LoadOutcome::failed(
            artifact,
            table,
            max_attempts,
            last_error.unwrap_or_default(),
        )
    }

    async fn load_once(&self, table: &str, artifact: &Path) -> Result<u64> {
        let mut session = self.connector.connect().await?;
        let result = self.load_into(session.as_mut(), table, artifact).await;

        if let Err(e) = session.close().await {
            warn!("{}: failed to close destination session - {}", table, e);
        }
        result
    }

    async fn load_into(
        &self,
        session: &mut dyn DestinationSession,
        table: &str,
        artifact: &Path,
    ) -> Result<u64> {
        if self.settings.create_tables {
            if let Some(ddl) = read_ddl(artifact)? {
                if !session.table_exists(table).await? {
                    session.execute_ddl(&ddl).await?;
                    info!("{}: created destination table", table);
                }
            }
        }

        let mut reader = ArtifactReader::open(artifact)?;
        let columns = reader.columns().to_vec();
        let mut loaded = 0u64;

        loop {
            let batch = reader.next_batch(self.settings.batch_size)?;
            if batch.is_empty() {
                break;
            }
            loaded += session.insert_rows(table, &columns, &batch).await?;
            debug!("{}: {} rows inserted so far", table, loaded);
        }

        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::StagingArea;
    use crate::testing::{self, row, FakeDestination};
    use tempfile::TempDir;

    fn settings(max_retries: u32) -> LoadSettings {
        LoadSettings {
            batch_size: 2,
            max_retries,
            retry_backoff: Duration::ZERO,
            create_tables: true,
        }
    }

    fn stage(dir: &TempDir, table: &str, rows: usize) -> PathBuf {
        let staging = StagingArea::new(dir.path());
        let rows = (0..rows)
            .map(|i| row(&[Some(i.to_string().as_str()), Some("x")]))
            .collect();
        let ddl = format!(r#"CREATE TABLE "{}" ("id" INTEGER, "name" VARCHAR)"#, table);
        testing::stage(&staging, table, &ddl, &["id", "name"], rows).unwrap()
    }

    #[tokio::test]
    async fn test_success_loads_rows_and_deletes_artifact() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "C", 5);
        let dest = FakeDestination::new();
        let loader = Loader::new(Arc::new(dest.clone()), settings(3));

        let outcome = loader.attempt(&path).await;

        assert!(outcome.success);
        assert_eq!(outcome.table, "C");
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(outcome.rows_loaded, 5);
        assert!(outcome.last_error.is_none());
        assert_eq!(dest.rows("C").unwrap().len(), 5);
        assert_eq!(dest.insert_calls("C"), 3);
        assert_eq!(dest.ddl_statements().len(), 1);
        assert!(!path.exists());
        assert!(!path.with_extension("sql").exists());
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        for k in [0u32, 1, 2, 3, 5] {
            let dir = TempDir::new().unwrap();
            let path = stage(&dir, "C", 1);
            let dest = FakeDestination::new().fail_inserts("C", k);
            let loader = Loader::new(Arc::new(dest.clone()), settings(3));

            let outcome = loader.attempt(&path).await;

            assert_eq!(outcome.attempts_used, (k + 1).min(3), "k = {}", k);
            assert_eq!(outcome.success, k < 3, "k = {}", k);
            assert_eq!(path.exists(), k >= 3, "k = {}", k);
            assert_eq!(dest.sessions_opened(), outcome.attempts_used as usize);
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_artifact() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "C", 3);
        let dest = FakeDestination::new().fail_inserts("C", 3);
        let loader = Loader::new(Arc::new(dest.clone()), settings(3));

        let outcome = loader.attempt(&path).await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts_used, 3);
        assert!(outcome
            .last_error
            .as_deref()
            .unwrap()
            .contains("warehouse suspended"));
        assert!(path.exists());
        assert!(path.with_extension("sql").exists());
        assert!(dest.rows("C").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_closed_after_every_attempt() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "C", 1);
        let dest = FakeDestination::new().fail_inserts("C", 2);
        let loader = Loader::new(Arc::new(dest.clone()), settings(3));

        assert!(loader.attempt(&path).await.success);
        assert_eq!(dest.sessions_opened(), 3);
        assert_eq!(dest.sessions_closed(), 3);
    }

    #[tokio::test]
    async fn test_connect_failure_consumes_an_attempt() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "C", 1);
        let dest = FakeDestination::new().fail_connects(1);
        let loader = Loader::new(Arc::new(dest.clone()), settings(2));

        let outcome = loader.attempt(&path).await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts_used, 2);
    }

    #[tokio::test]
    async fn test_existing_table_is_not_recreated() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "C", 2);
        let dest = FakeDestination::new().with_existing_table("C");
        let loader = Loader::new(Arc::new(dest.clone()), settings(1));

        assert!(loader.attempt(&path).await.success);
        assert!(dest.ddl_statements().is_empty());
        assert_eq!(dest.rows("C").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_without_create_tables_missing_table_fails() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "C", 2);
        let dest = FakeDestination::new();
        let mut settings = settings(2);
        settings.create_tables = false;
        let loader = Loader::new(Arc::new(dest.clone()), settings);

        let outcome = loader.attempt(&path).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts_used, 2);
        assert!(dest.ddl_statements().is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_header_only_artifact_loads_zero_rows() {
        let dir = TempDir::new().unwrap();
        let path = stage(&dir, "Empty", 0);
        let dest = FakeDestination::new();
        let loader = Loader::new(Arc::new(dest.clone()), settings(1));

        let outcome = loader.attempt(&path).await;
        assert!(outcome.success);
        assert_eq!(outcome.rows_loaded, 0);
        assert_eq!(dest.insert_calls("Empty"), 0);
        assert!(dest.rows("Empty").is_some());
        assert!(!path.exists());
    }
}
