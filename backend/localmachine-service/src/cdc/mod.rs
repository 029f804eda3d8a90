//! Change-data-capture model and plumbing.
//!
//! [`PgLogicalCapture`] decodes the replication slot into ordered
//! [`CdcBatch`]es, one per committed transaction, and hands them to the
//! [`CdcConsumer`], which fans them out to [`CdcListener`]s by table.

pub mod capture;
pub mod consumer;
pub mod listener;
pub mod mapper;
pub mod offset;

pub use capture::PgLogicalCapture;
pub use consumer::CdcConsumer;
pub use listener::{CdcDispatcher, CdcListener};
pub use mapper::CdcRecordMapper;
pub use offset::{InMemoryOffsetStore, OffsetStore, PgOffsetStore};

use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_SCHEMA: &str = "public";

/// Text form of a decoded column value; JSON null is SQL NULL
pub fn json_to_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Double-quote an SQL identifier (table, publication) for interpolation
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema-qualified table identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn public(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_SCHEMA, name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// One captured row change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcRecord {
    pub table: TableId,
    /// Column names, in table order
    pub columns: Vec<String>,
    /// One value per column; `None` is SQL NULL
    pub values: Vec<Option<String>>,
    pub deleted: bool,
    /// Source position (commit LSN of the transaction), used to resume the stream
    pub position: i64,
}

impl CdcRecord {
    pub fn value(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)?.as_deref()
    }
}

/// All row changes of one committed source transaction, commit order
#[derive(Debug, Clone, PartialEq)]
pub struct CdcBatch {
    pub records: Vec<CdcRecord>,
}

impl CdcBatch {
    pub fn new(records: Vec<CdcRecord>) -> Self {
        Self { records }
    }

    /// Source position to resume after once this batch is handled
    pub fn last_position(&self) -> Option<i64> {
        self.records.iter().map(|r| r.position).max()
    }
}

/// Row change inside a [`TableChangeEvent`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    pub values: Vec<Option<String>>,
    pub deleted: bool,
}

/// Row changes of one table sharing one column layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChangeEvent {
    pub schema_name: String,
    pub table_name: String,
    /// Bumped whenever the column layout of the table changes within a stream
    pub schema_version: u32,
    pub columns: Vec<String>,
    pub row_changes: Vec<RowChangeEvent>,
}

impl TableChangeEvent {
    /// Value of `column` in row `row`
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.row_changes.get(row)?.values.get(idx)?.as_deref()
    }
}
