//! Representation of and text serialization for PostgreSQL datums.
//!
//! This module exports a [`Value`] type that maps directly to a PostgreSQL
//! datum, the [`PgType`] table resolving textual type names to wire oids,
//! and the [`StatementResult`] intermediate form that sits between the
//! backend client and the wire-message builder.

mod format;
mod types;

pub use format::format_value;
pub use types::{lookup_type, PgType, TYPE_TEXT};

/// A typed scalar produced by the backend or synthesized locally.
///
/// Each variant converts to its textual wire form through a single
/// function, [`format_value`]; NULL is encoded at the framing layer
/// (column length -1), never here.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Date(chrono::NaiveDate),
    Timestamp(chrono::DateTime<chrono::Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Description of one result column: the intermediate representation
/// between the backend client and the message builder, and the input to
/// RowDescription generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDesc {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnDesc {
    pub fn new<S: Into<String>>(name: S, type_name: &str) -> ColumnDesc {
        ColumnDesc {
            name: name.into(),
            type_name: type_name.to_string(),
            nullable: true,
        }
    }
}

/// A normalized query result.
///
/// `rows` are ordered to match `columns`. `rows_updated` is present for
/// data-modifying statements; `command_tag` overrides the inferred
/// CommandComplete tag when the backend supplies one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementResult {
    pub columns: Vec<ColumnDesc>,
    pub rows: Vec<Vec<Value>>,
    pub rows_updated: Option<i64>,
    pub command_tag: Option<String>,
}

impl StatementResult {
    /// A result with no rows, no columns and no update count, rendered to
    /// the client as an EmptyQueryResponse.
    pub fn empty() -> StatementResult {
        StatementResult::default()
    }

    /// A single-row, single-column textual result.
    pub fn single(column: &str, value: &str) -> StatementResult {
        StatementResult {
            columns: vec![ColumnDesc::new(column, "text")],
            rows: vec![vec![Value::Text(value.to_string())]],
            rows_updated: None,
            command_tag: None,
        }
    }
}
