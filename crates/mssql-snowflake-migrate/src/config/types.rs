//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MSSQL).
    pub source: SourceConfig,

    /// Target warehouse configuration (Snowflake).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source database (MSSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (always "mssql").
    #[serde(default = "default_mssql")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Source schema (default: "dbo").
    #[serde(default = "default_dbo_schema")]
    pub schema: String,

    /// Encrypt connection (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

/// Target warehouse (Snowflake) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Warehouse type (always "snowflake").
    #[serde(default = "default_snowflake")]
    pub r#type: String,

    /// Account identifier, e.g. "xy12345.eu-west-1".
    pub account: String,

    /// Base URL override (default: https://<account>.snowflakecomputing.com).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Bearer token for the SQL API.
    pub token: String,

    /// Token kind: OAUTH, KEYPAIR_JWT or PROGRAMMATIC_ACCESS_TOKEN.
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Database name.
    pub database: String,

    /// Target schema (default: "PUBLIC").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Virtual warehouse to run statements on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<String>,

    /// Role to assume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Per-statement timeout in seconds (default: 600).
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

impl TargetConfig {
    /// Base URL of the SQL API.
    pub fn base_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.snowflakecomputing.com", self.account),
        }
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("account", &self.account)
            .field("endpoint", &self.endpoint)
            .field("token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("warehouse", &self.warehouse)
            .field("role", &self.role)
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Directory holding staging artifacts (default: "staging").
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Progress record path (default: "exported_tables.txt").
    #[serde(default = "default_progress_file")]
    pub progress_file: PathBuf,

    /// Tables never to export, by exact name.
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Rows per insert batch (default: 15000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Load attempts per artifact. Required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Seconds to wait between load attempts (default: 10).
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Parallel load workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Execute staged DDL before loading when the table is missing (default: true).
    #[serde(default = "default_true")]
    pub create_tables: bool,

    /// Start loading artifacts while the export is still running (default: false).
    #[serde(default)]
    pub overlap_phases: bool,
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Workers: cores - 2, but at least 2 and at most 32
        if self.workers.is_none() {
            let workers = resources.cpu_cores.saturating_sub(2).clamp(2, 32);
            self.workers = Some(workers);
        }

        info!("Auto-tuned config: workers={}", self.get_workers());
        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    /// Load attempts per artifact; validation guarantees this is set.
    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(1).max(1)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

// Default value functions for serde
fn default_mssql() -> String {
    "mssql".to_string()
}

fn default_snowflake() -> String {
    "snowflake".to_string()
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_public_schema() -> String {
    "PUBLIC".to_string()
}

fn default_true_string() -> String {
    "true".to_string()
}

fn default_pool_size() -> u32 {
    4
}

fn default_token_type() -> String {
    "OAUTH".to_string()
}

fn default_statement_timeout() -> u64 {
    600
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("staging")
}

fn default_progress_file() -> PathBuf {
    PathBuf::from("exported_tables.txt")
}

fn default_batch_size() -> usize {
    15_000
}

fn default_retry_backoff_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}
