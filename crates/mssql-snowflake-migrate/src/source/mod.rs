//! Source catalog interface and its MSSQL implementation.

mod types;

pub use types::*;

use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

/// Trait for source database operations.
///
/// Every call acquires its own connection and releases it before returning,
/// so implementations can be shared freely behind an `Arc`.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// List base table names in catalog order.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Describe a table's columns in declared order.
    async fn describe_columns(&self, table: &str) -> Result<Table>;

    /// Stream every row of a table into `sink`, columns in the descriptor's
    /// order. Returns the number of rows pushed.
    async fn stream_rows(&self, table: &Table, sink: &mut dyn RowSink) -> Result<u64>;

    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()>;
}

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        match self.config.encrypt.to_lowercase().as_str() {
            "false" | "no" | "0" | "disable" => {
                config.encryption(EncryptionLevel::NotSupported);
            }
            _ => {
                if self.config.trust_server_cert {
                    config.trust_cert();
                }
                config.encryption(EncryptionLevel::Required);
            }
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// MSSQL source with connection pooling.
pub struct MssqlSource {
    pool: Pool<TiberiusConnectionManager>,
    schema: String,
}

impl MssqlSource {
    /// Connect a pool sized by `source.pool_size` and verify it with `SELECT 1`.
    pub async fn connect(config: SourceConfig) -> Result<Self> {
        let max_size = config.pool_size.max(1);
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "creating MSSQL pool"))?;

        let source = Self {
            pool,
            schema: config.schema.clone(),
        };
        source.ping().await?;

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_size
        );

        Ok(source)
    }

    /// Get a pooled connection.
    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "acquiring MSSQL connection"))
    }
}

#[async_trait]
impl SourceCatalog for MssqlSource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut client = self.get_client().await?;

        let query = r#"
            SELECT t.TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES t
            WHERE t.TABLE_TYPE = 'BASE TABLE'
              AND t.TABLE_SCHEMA = @P1
            ORDER BY t.TABLE_NAME
        "#;

        let mut q = Query::new(query);
        q.bind(self.schema.as_str());

        let rows = q.query(&mut *client).await?.into_first_result().await?;

        let tables: Vec<String> = rows
            .iter()
            .map(|row| row.get::<&str, _>(0).unwrap_or_default().to_string())
            .collect();

        info!("Found {} tables in schema '{}'", tables.len(), self.schema);
        Ok(tables)
    }

    async fn describe_columns(&self, table: &str) -> Result<Table> {
        let mut client = self.get_client().await?;

        let query = r#"
            SELECT COLUMN_NAME, DATA_TYPE, ORDINAL_POSITION
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2
            ORDER BY ORDINAL_POSITION
        "#;

        let mut q = Query::new(query);
        q.bind(self.schema.as_str());
        q.bind(table);

        let rows = q.query(&mut *client).await?.into_first_result().await?;

        let columns: Vec<Column> = rows
            .iter()
            .map(|row| {
                Column::new(
                    row.get::<&str, _>(0).unwrap_or_default(),
                    row.get::<&str, _>(1).unwrap_or_default(),
                    row.get::<i32, _>(2).unwrap_or(0),
                )
            })
            .collect();

        if columns.is_empty() {
            return Err(MigrateError::SchemaExtraction(format!(
                "no columns found for {}.{}",
                self.schema, table
            )));
        }

        debug!("Loaded {} columns for {}.{}", columns.len(), self.schema, table);
        Ok(Table {
            schema: self.schema.clone(),
            name: table.to_string(),
            columns,
        })
    }

    async fn stream_rows(&self, table: &Table, sink: &mut dyn RowSink) -> Result<u64> {
        let mut client = self.get_client().await?;

        let select_list = table
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {}.{}",
            select_list,
            quote_ident(&table.schema),
            quote_ident(&table.name)
        );
        debug!("{}", sql);

        let mut stream = client.simple_query(sql).await?.into_row_stream();
        let mut count = 0u64;
        while let Some(row) = stream.try_next().await? {
            sink.push(row.into_iter().map(render_cell).collect())?;
            count += 1;
        }

        debug!("Streamed {} rows from {}", count, table.full_name());
        Ok(count)
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }
}

/// Quote an identifier with brackets.
fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Render a TDS value as CSV text; NULL becomes `None`.
fn render_cell(data: ColumnData<'static>) -> Option<String> {
    match data {
        ColumnData::U8(v) => v.map(|v| v.to_string()),
        ColumnData::I16(v) => v.map(|v| v.to_string()),
        ColumnData::I32(v) => v.map(|v| v.to_string()),
        ColumnData::I64(v) => v.map(|v| v.to_string()),
        ColumnData::F32(v) => v.map(|v| v.to_string()),
        ColumnData::F64(v) => v.map(|v| v.to_string()),
        ColumnData::Bit(v) => v.map(|v| v.to_string()),
        ColumnData::String(v) => v.map(|s| s.into_owned()),
        ColumnData::Guid(v) => v.map(|g| g.to_string()),
        ColumnData::Binary(v) => v.map(|b| hex::encode(b.as_ref())),
        ColumnData::Numeric(v) => v.map(|n| n.to_string()),
        ColumnData::Xml(v) => v.map(|x| x.into_owned().into_string()),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data)
                .ok()
                .flatten()
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())
        }
        ColumnData::Date(_) => NaiveDate::from_sql(&data)
            .ok()
            .flatten()
            .map(|d| d.format("%Y-%m-%d").to_string()),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)
            .ok()
            .flatten()
            .map(|t| t.format("%H:%M:%S%.f").to_string()),
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(&data)
            .ok()
            .flatten()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.f %:z").to_string()),
    }
}
