//! Snowflake destination over the SQL API (`/api/v2/statements`).

use super::{quote_ident, DestinationConnector, DestinationSession};
use crate::config::TargetConfig;
use crate::error::{MigrateError, Result};
use crate::source::Row;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const STATEMENTS_PATH: &str = "/api/v2/statements";
const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";

/// Upper bound on bind values in one INSERT statement.
const MAX_BIND_VALUES: usize = 16_384;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Added to the statement timeout for HTTP round trips.
const TRANSPORT_SLACK: Duration = Duration::from_secs(30);

/// Opens [`SnowflakeSession`]s for a configured account.
#[derive(Debug, Clone)]
pub struct SnowflakeConnector {
    config: Arc<TargetConfig>,
}

impl SnowflakeConnector {
    pub fn new(config: TargetConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl DestinationConnector for SnowflakeConnector {
    async fn connect(&self) -> Result<Box<dyn DestinationSession>> {
        let session = SnowflakeSession::open(self.config.clone())?;
        Ok(Box::new(session))
    }
}

/// A Snowflake session: its own HTTP client and connection pool.
pub struct SnowflakeSession {
    client: Client,
    config: Arc<TargetConfig>,
    statements_url: String,
    closed: bool,
}

#[derive(Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    schema: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    bindings: BTreeMap<String, Binding>,
}

/// A positional bind value. Everything is bound as TEXT and coerced by
/// Snowflake into the column type.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct Binding {
    #[serde(rename = "type")]
    kind: &'static str,
    value: Option<String>,
}

impl Binding {
    fn text(value: Option<String>) -> Self {
        Self { kind: "TEXT", value }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sql_state: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    data: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    stats: Option<StatementStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementStats {
    #[serde(default)]
    num_rows_inserted: Option<u64>,
}

enum Reply {
    Complete(StatementResponse),
    Running(String),
}

impl SnowflakeSession {
    /// Build a session. No request is made until the first statement.
    pub fn open(config: Arc<TargetConfig>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.statement_timeout_secs) + TRANSPORT_SLACK)
            .user_agent(concat!("mssql-snowflake-migrate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let statements_url = format!("{}{}", config.base_url(), STATEMENTS_PATH);

        Ok(Self {
            client,
            config,
            statements_url,
            closed: false,
        })
    }

    async fn execute(
        &self,
        sql: &str,
        bindings: BTreeMap<String, Binding>,
    ) -> Result<StatementResponse> {
        if self.closed {
            return Err(MigrateError::Target("session is closed".into()));
        }

        let body = StatementRequest {
            statement: sql,
            timeout: self.config.statement_timeout_secs,
            database: &self.config.database,
            schema: &self.config.schema,
            warehouse: self.config.warehouse.as_deref(),
            role: self.config.role.as_deref(),
            bindings,
        };

        let response = self
            .client
            .post(&self.statements_url)
            .query(&[("requestId", Uuid::new_v4().to_string())])
            .bearer_auth(&self.config.token)
            .header(TOKEN_TYPE_HEADER, &self.config.token_type)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        match decode(response).await? {
            Reply::Complete(result) => Ok(result),
            Reply::Running(handle) => self.wait_for(&handle).await,
        }
    }

    /// Poll an asynchronously executing statement until it completes.
    async fn wait_for(&self, handle: &str) -> Result<StatementResponse> {
        let deadline = Instant::now()
            + Duration::from_secs(self.config.statement_timeout_secs)
            + TRANSPORT_SLACK;
        let url = format!("{}/{}", self.statements_url, handle);

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.config.token)
                .header(TOKEN_TYPE_HEADER, &self.config.token_type)
                .header(ACCEPT, "application/json")
                .send()
                .await?;

            match decode(response).await? {
                Reply::Complete(result) => return Ok(result),
                Reply::Running(_) if Instant::now() >= deadline => {
                    return Err(MigrateError::Target(format!(
                        "statement {} still running after {}s",
                        handle, self.config.statement_timeout_secs
                    )));
                }
                Reply::Running(_) => debug!("Statement {} still running", handle),
            }
        }
    }
}

#[async_trait]
impl DestinationSession for SnowflakeSession {
    async fn execute_ddl(&mut self, ddl: &str) -> Result<()> {
        debug!("Executing DDL: {}", ddl);
        self.execute(ddl, BTreeMap::new()).await?;
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let sql = format!(
            "SHOW TABLES LIKE '{}' IN SCHEMA {}.{}",
            table.replace('\'', "''"),
            self.config.database,
            self.config.schema
        );
        let result = self.execute(&sql, BTreeMap::new()).await?;

        // LIKE is case-insensitive and treats `_` as a wildcard, while tables
        // are created with quoted, case-sensitive names.
        let exists = result.data.unwrap_or_default().iter().any(|row| {
            row.get(1)
                .and_then(|name| name.as_deref())
                .map(|name| name == table)
                .unwrap_or(false)
        });
        Ok(exists)
    }

    async fn insert_rows(&mut self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0u64;
        for chunk in rows.chunks(rows_per_statement(columns.len())) {
            let (sql, bindings) = insert_statement(table, columns, chunk)?;
            let result = self.execute(&sql, bindings).await?;
            inserted += result
                .stats
                .and_then(|s| s.num_rows_inserted)
                .unwrap_or(chunk.len() as u64);
        }

        debug!("Inserted {} rows into {}", inserted, table);
        Ok(inserted)
    }

    async fn ping(&mut self) -> Result<()> {
        self.execute("SELECT 1", BTreeMap::new()).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Classify a response: finished, still running, or an error.
async fn decode(response: Response) -> Result<Reply> {
    let status = response.status();
    let text = response.text().await?;
    let parsed: StatementResponse = serde_json::from_str(&text).unwrap_or_default();

    if status == StatusCode::ACCEPTED {
        return match parsed.statement_handle {
            Some(handle) => Ok(Reply::Running(handle)),
            None => Err(MigrateError::Target(
                "statement accepted without a statement handle".into(),
            )),
        };
    }

    if !status.is_success() {
        return Err(statement_error(status, &parsed, &text));
    }

    Ok(Reply::Complete(parsed))
}

fn statement_error(status: StatusCode, parsed: &StatementResponse, raw: &str) -> MigrateError {
    let message = match &parsed.message {
        Some(message) => message.clone(),
        None if raw.is_empty() => "<empty response>".to_string(),
        None => raw.to_string(),
    };

    let mut detail = format!("HTTP {}: {}", status.as_u16(), message);
    if let Some(code) = &parsed.code {
        detail.push_str(&format!(" (code {}", code));
        if let Some(state) = &parsed.sql_state {
            detail.push_str(&format!(", sqlState {}", state));
        }
        detail.push(')');
    }
    MigrateError::Target(detail)
}

fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_VALUES / column_count.max(1)).max(1)
}

/// Build a multi-row `INSERT ... VALUES` with one TEXT binding per cell.
fn insert_statement(
    table: &str,
    columns: &[String],
    rows: &[Row],
) -> Result<(String, BTreeMap<String, Binding>)> {
    if columns.is_empty() {
        return Err(MigrateError::Target(format!(
            "cannot insert into {} without columns",
            table
        )));
    }

    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let mut bindings = BTreeMap::new();
    let mut values = Vec::with_capacity(rows.len());

    for row in rows {
        if row.len() != columns.len() {
            return Err(MigrateError::Target(format!(
                "row for {} has {} values, expected {}",
                table,
                row.len(),
                columns.len()
            )));
        }
        for cell in row {
            let position = bindings.len() + 1;
            bindings.insert(position.to_string(), Binding::text(cell.clone()));
        }
        values.push(placeholders.as_str());
    }

    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        column_list,
        values.join(", ")
    );
    Ok((sql, bindings))
}
