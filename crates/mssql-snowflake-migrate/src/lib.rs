//! # mssql-snowflake-migrate
//!
//! Resumable MSSQL to Snowflake migration library.
//!
//! A run has two phases:
//!
//! - **Export** stages every source table as a CSV artifact with a DDL
//!   sidecar, and appends the table to an append-only progress record once
//!   the artifact is complete. Recorded tables are never exported again.
//! - **Load** appends each staged artifact to Snowflake with bounded retries,
//!   in parallel, and deletes the artifact only after a successful load.
//!
//! An interrupted or partially failed run is resumed by running again: the
//! progress record and the artifacts left on disk carry all the state.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_snowflake_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> mssql_snowflake_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run().await?;
//!     println!("Loaded {} rows ({})", result.rows_loaded, result.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ddl;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod load;
pub mod orchestrator;
pub mod progress;
pub mod source;
pub mod staging;
pub mod target;
pub mod typemap;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use dispatch::{DispatchReport, Dispatcher};
pub use error::{MigrateError, Result};
pub use export::{ExportReport, Exporter, TableFailure};
pub use load::{LoadOutcome, LoadSettings, Loader};
pub use orchestrator::{HealthCheckResult, MigrationPlan, MigrationResult, Orchestrator};
pub use progress::ProgressTracker;
pub use source::{MssqlSource, SourceCatalog, Table};
pub use staging::StagingArea;
pub use target::{DestinationConnector, DestinationSession, SnowflakeConnector};
