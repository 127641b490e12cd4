//! Destination warehouse interface and its Snowflake implementation.

mod snowflake;

pub use snowflake::{SnowflakeConnector, SnowflakeSession};

use crate::error::Result;
use crate::source::Row;
use async_trait::async_trait;

/// Opens destination sessions.
///
/// Every load attempt asks for a fresh session; connectors hold no
/// per-attempt state and are shared across workers behind an `Arc`.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    /// Open a new session.
    async fn connect(&self) -> Result<Box<dyn DestinationSession>>;
}

/// One destination connection, scoped to a single load attempt.
#[async_trait]
pub trait DestinationSession: Send {
    /// Execute a DDL statement.
    async fn execute_ddl(&mut self, ddl: &str) -> Result<()>;

    /// Check whether a table exists in the configured database and schema.
    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Append rows to a table. Cells are positional with `columns`.
    async fn insert_rows(&mut self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64>;

    /// Round-trip a trivial statement.
    async fn ping(&mut self) -> Result<()>;

    /// Release the session. Called once, on success and on failure.
    async fn close(&mut self) -> Result<()>;
}

/// Quote a Snowflake identifier. Quoted names are case-sensitive and may be
/// reserved words or contain spaces.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
