//! Synthesized replies for system-catalog queries.
//!
//! Admin tools and drivers probe the catalog on connect (`SELECT
//! version()`, `pg_database`, schema listings). The backend service knows
//! nothing about these tables, so the gateway answers locally; only
//! `information_schema.tables` is worth forwarding, since the backend can
//! genuinely resolve it.

use tracing::debug;

use crate::classify::SystemQuery;
use crate::dataapi::SqlBackend;
use crate::pgrepr::{ColumnDesc, StatementResult, Value};

/// Column tokens recognized when inferring metadata for an unhandled
/// catalog query, with the type each one carries in PostgreSQL.
const KNOWN_COLUMNS: &[(&str, &str)] = &[
    ("proname", "name"),
    ("attname", "name"),
    ("typname", "name"),
    ("relname", "name"),
    ("nspname", "name"),
    ("datname", "name"),
    ("oid", "oid"),
    ("relkind", "bpchar"),
    ("attnum", "int2"),
    ("atttypid", "oid"),
];

/// Answers a classified system query without involving the backend,
/// except for `information_schema.tables` which is forwarded unchanged.
pub async fn respond(
    sql: &str,
    kind: SystemQuery,
    backend: &mut dyn SqlBackend,
    database: &str,
    version_banner: &str,
) -> StatementResult {
    match kind {
        SystemQuery::Version => StatementResult::single("version", version_banner),
        SystemQuery::CurrentSchema => StatementResult::single("current_schema", "public"),
        SystemQuery::CurrentUser => StatementResult::single("current_user", "postgres"),
        SystemQuery::CurrentDatabase => StatementResult::single("current_database", database),
        SystemQuery::DatabaseCatalog => database_row(database),
        SystemQuery::InformationSchemaTables => match backend.execute(sql, &[]).await {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, "forwarded catalog query failed, replying empty");
                inferred_empty(sql)
            }
        },
        SystemQuery::Generic => inferred_empty(sql),
    }
}

/// The one synthetic row in the simulated `pg_database` catalog.
fn database_row(database: &str) -> StatementResult {
    StatementResult {
        columns: vec![
            ColumnDesc::new("did", "oid"),
            ColumnDesc::new("datname", "name"),
            ColumnDesc::new("datallowconn", "bool"),
            ColumnDesc::new("serverencoding", "text"),
            ColumnDesc::new("cancreate", "bool"),
            ColumnDesc::new("datistemplate", "bool"),
        ],
        rows: vec![vec![
            Value::Int(12345),
            Value::Text(database.to_string()),
            Value::Bool(true),
            Value::Text("UTF8".to_string()),
            Value::Bool(false),
            Value::Bool(false),
        ]],
        rows_updated: None,
        command_tag: None,
    }
}

/// An empty record set whose column metadata is inferred from recognized
/// column tokens in the statement, so clients can still render a result
/// grid. Falls back to a single `result` column.
fn inferred_empty(sql: &str) -> StatementResult {
    let lowered = sql.to_ascii_lowercase();
    let mut columns: Vec<ColumnDesc> = KNOWN_COLUMNS
        .iter()
        .filter(|(token, _)| lowered.contains(token))
        .map(|(token, type_name)| ColumnDesc::new(*token, type_name))
        .collect();
    if columns.is_empty() {
        columns = vec![ColumnDesc::new("result", "text")];
    }
    StatementResult {
        columns,
        ..StatementResult::empty()
    }
}
