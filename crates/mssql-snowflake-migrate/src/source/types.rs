//! Schema and row types read from the source.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Schema name.
    pub schema: String,

    /// Table name.
    pub name: String,

    /// Column definitions, in declared order.
    pub columns: Vec<Column>,
}

impl Table {
    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Column names in declared order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Data type (e.g., "int", "varchar", "datetime2").
    pub data_type: String,

    /// Ordinal position (1-based).
    pub ordinal_pos: i32,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, ordinal_pos: i32) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            ordinal_pos,
        }
    }
}

/// A single text-rendered row; `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// Receives rows as they are read from the source.
pub trait RowSink: Send {
    /// Accept one row, cells in the descriptor's column order.
    fn push(&mut self, row: Row) -> Result<()>;
}
