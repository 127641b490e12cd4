//! In-memory source and destination used by unit and pipeline tests.

use crate::error::{MigrateError, Result};
use crate::source::{Column, Row, RowSink, SourceCatalog, Table};
use crate::staging::StagingArea;
use crate::target::{DestinationConnector, DestinationSession};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A source table held in memory.
#[derive(Debug, Clone)]
pub struct FakeTable {
    pub table: Table,
    pub rows: Vec<Row>,
}

/// In-memory [`SourceCatalog`].
#[derive(Debug, Default)]
pub struct FakeSource {
    tables: Vec<FakeTable>,
    failing_fetch: HashSet<String>,
    fail_listing: bool,
    queried: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table; `columns` are `(name, mssql type)` pairs in declared order.
    pub fn with_table(mut self, name: &str, columns: &[(&str, &str)], rows: Vec<Row>) -> Self {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(i, (col, ty))| Column::new(*col, *ty, i as i32 + 1))
            .collect();
        self.tables.push(FakeTable {
            table: Table {
                schema: "dbo".into(),
                name: name.into(),
                columns,
            },
            rows,
        });
        self
    }

    /// Make `stream_rows` fail for one table after its rows were pushed.
    pub fn failing_fetch(mut self, name: &str) -> Self {
        self.failing_fetch.insert(name.into());
        self
    }

    /// Make `list_tables` fail.
    pub fn failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    /// Tables that were described or fetched, in call order.
    pub fn queried(&self) -> Vec<String> {
        lock(&self.queried).clone()
    }

    fn find(&self, name: &str) -> Result<&FakeTable> {
        self.tables
            .iter()
            .find(|t| t.table.name == name)
            .ok_or_else(|| MigrateError::SchemaExtraction(format!("no such table {}", name)))
    }
}

#[async_trait]
impl SourceCatalog for FakeSource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        if self.fail_listing {
            return Err(MigrateError::SchemaExtraction(
                "catalog unavailable".into(),
            ));
        }
        Ok(self.tables.iter().map(|t| t.table.name.clone()).collect())
    }

    async fn describe_columns(&self, table: &str) -> Result<Table> {
        lock(&self.queried).push(table.to_string());
        Ok(self.find(table)?.table.clone())
    }

    async fn stream_rows(&self, table: &Table, sink: &mut dyn RowSink) -> Result<u64> {
        lock(&self.queried).push(table.name.clone());
        let fake = self.find(&table.name)?;
        for row in &fake.rows {
            sink.push(row.clone())?;
        }
        if self.failing_fetch.contains(&table.name) {
            return Err(MigrateError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )));
        }
        Ok(fake.rows.len() as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DestinationState {
    tables: HashMap<String, Vec<Row>>,
    ddl: Vec<String>,
    insert_failures: HashMap<String, u32>,
    connect_failures: u32,
    insert_calls: HashMap<String, usize>,
    sessions_opened: usize,
    sessions_closed: usize,
}

/// In-memory [`DestinationConnector`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeDestination {
    state: Arc<Mutex<DestinationState>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    insert_delay: Duration,
}

impl FakeDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` inserts into `table`.
    pub fn fail_inserts(self, table: &str, times: u32) -> Self {
        self.lock().insert_failures.insert(table.into(), times);
        self
    }

    /// Fail the next `times` session opens.
    pub fn fail_connects(self, times: u32) -> Self {
        self.lock().connect_failures = times;
        self
    }

    /// Pretend `table` already exists (empty).
    pub fn with_existing_table(self, table: &str) -> Self {
        self.lock().tables.insert(table.into(), Vec::new());
        self
    }

    /// Sleep inside every insert, to make overlapping sessions observable.
    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = delay;
        self
    }

    /// Rows appended to `table`, or `None` if it was never created.
    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        self.lock().tables.get(table).cloned()
    }

    pub fn ddl_statements(&self) -> Vec<String> {
        self.lock().ddl.clone()
    }

    pub fn insert_calls(&self, table: &str) -> usize {
        self.lock().insert_calls.get(table).copied().unwrap_or(0)
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.lock().sessions_closed
    }

    /// Highest number of sessions open at the same time.
    pub fn max_concurrent_sessions(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, DestinationState> {
        lock(&self.state)
    }
}

#[async_trait]
impl DestinationConnector for FakeDestination {
    async fn connect(&self) -> Result<Box<dyn DestinationSession>> {
        {
            let mut state = self.lock();
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(MigrateError::Target("connection refused".into()));
            }
            state.sessions_opened += 1;
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            owner: self.clone(),
            open: true,
        }))
    }
}

struct FakeSession {
    owner: FakeDestination,
    open: bool,
}

impl FakeSession {
    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.owner.active.fetch_sub(1, Ordering::SeqCst);
            self.owner.lock().sessions_closed += 1;
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl DestinationSession for FakeSession {
    async fn execute_ddl(&mut self, ddl: &str) -> Result<()> {
        let name = ddl
            .strip_prefix("CREATE TABLE ")
            .and_then(created_table_name)
            .ok_or_else(|| MigrateError::Target(format!("unsupported statement: {}", ddl)))?;
        let name = name.as_str();
        if ddl.ends_with("()") {
            return Err(MigrateError::Target(format!(
                "table {} must have at least one column",
                name
            )));
        }

        let mut state = self.owner.lock();
        if state.tables.contains_key(name) {
            return Err(MigrateError::Target(format!("table {} already exists", name)));
        }
        state.ddl.push(ddl.to_string());
        state.tables.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self
            .owner
            .lock()
            .tables
            .contains_key(table))
    }

    async fn insert_rows(&mut self, table: &str, _columns: &[String], rows: &[Row]) -> Result<u64> {
        if !self.owner.insert_delay.is_zero() {
            tokio::time::sleep(self.owner.insert_delay).await;
        }

        let mut state = self.owner.lock();
        *state.insert_calls.entry(table.to_string()).or_default() += 1;

        if let Some(remaining) = state.insert_failures.get_mut(table) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MigrateError::Target(format!(
                    "warehouse suspended while inserting into {}",
                    table
                )));
            }
        }

        let stored = state
            .tables
            .get_mut(table)
            .ok_or_else(|| MigrateError::Target(format!("table {} does not exist", table)))?;
        stored.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

/// Table name at the start of a `CREATE TABLE` body, quoted or bare.
fn created_table_name(rest: &str) -> Option<String> {
    match rest.strip_prefix('"') {
        Some(quoted) => {
            let mut name = String::new();
            let mut chars = quoted.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                    } else {
                        return Some(name);
                    }
                }
                name.push(c);
            }
            None
        }
        None => rest.split_whitespace().next().map(String::from),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build a row from string literals; `None` is NULL.
pub fn row(cells: &[Option<&str>]) -> Row {
    cells.iter().map(|c| c.map(String::from)).collect()
}

/// Stage an in-memory table in one go.
pub fn stage(
    staging: &StagingArea,
    table: &str,
    ddl: &str,
    columns: &[&str],
    rows: Vec<Row>,
) -> Result<PathBuf> {
    let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    let mut writer = staging.begin(table, ddl, &columns)?;
    for row in rows {
        writer.push(row)?;
    }
    Ok(writer.finish()?.0)
}
