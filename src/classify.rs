//! Coarse classification of incoming SQL.
//!
//! The gateway never parses SQL syntax; it only recognizes the handful of
//! statement shapes that must not reach the backend: transaction control,
//! session parameters and system-catalog introspection. Everything else is
//! forwarded verbatim.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::pgrepr::StatementResult;
use crate::session::Session;

/// The routing decision for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryClass {
    Empty,
    Transaction(TransactionControl),
    Set { name: String, value: String },
    Show { name: String },
    System(SystemQuery),
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionControl {
    Begin,
    Commit,
    Rollback,
}

/// The recognized system-query shapes, refined from the catalog-reference
/// list when the statement names one unambiguously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemQuery {
    Version,
    CurrentSchema,
    CurrentUser,
    CurrentDatabase,
    DatabaseCatalog,
    InformationSchemaTables,
    Generic,
}

static BEGIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:begin|start\s+transaction)$").unwrap());
static COMMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^commit(?:\s+work)?$").unwrap());
static ROLLBACK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^rollback(?:\s+work)?$").unwrap());
static SET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^set\s+(\w+)\s*=\s*(.+)$").unwrap());
static SHOW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^show\s+(\w+)$").unwrap());

/// Substrings marking a statement as system-catalog introspection. Tool
/// ecosystems (psql, GUI admin clients, ORMs) issue these on connect; none
/// of them may reach the backend.
const SYSTEM_MARKERS: &[&str] = &[
    "pg_catalog.",
    "information_schema.",
    "pg_class",
    "pg_namespace",
    "pg_attribute",
    "pg_type",
    "pg_index",
    "pg_constraint",
    "pg_proc",
    "pg_stat_activity",
    "pg_tables",
    "pg_database",
    "pg_settings",
    "version(",
    "current_schema",
    "current_user",
    "current_database",
];

/// Normalizes a statement for classification: surrounding whitespace and
/// trailing semicolons are insignificant.
pub fn normalize(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim().to_string()
}

/// Classifies one normalized statement. Classification is pure and
/// deterministic: the same input always yields the same class.
pub fn classify(sql: &str) -> QueryClass {
    let sql = normalize(sql);
    if sql.is_empty() {
        return QueryClass::Empty;
    }
    if BEGIN_RE.is_match(&sql) {
        return QueryClass::Transaction(TransactionControl::Begin);
    }
    if COMMIT_RE.is_match(&sql) {
        return QueryClass::Transaction(TransactionControl::Commit);
    }
    if ROLLBACK_RE.is_match(&sql) {
        return QueryClass::Transaction(TransactionControl::Rollback);
    }
    if let Some(caps) = SET_RE.captures(&sql) {
        return QueryClass::Set {
            name: caps[1].to_ascii_lowercase(),
            value: strip_quotes(caps[2].trim()).to_string(),
        };
    }
    if let Some(caps) = SHOW_RE.captures(&sql) {
        return QueryClass::Show {
            name: caps[1].to_string(),
        };
    }
    let lowered = sql.to_ascii_lowercase();
    if SYSTEM_MARKERS.iter().any(|m| lowered.contains(m)) {
        return QueryClass::System(refine_system(&lowered));
    }
    QueryClass::Forward
}

fn refine_system(lowered: &str) -> SystemQuery {
    if lowered.contains("version(") {
        SystemQuery::Version
    } else if lowered.contains("current_schema") {
        SystemQuery::CurrentSchema
    } else if lowered.contains("current_user") {
        SystemQuery::CurrentUser
    } else if lowered.contains("current_database") {
        SystemQuery::CurrentDatabase
    } else if lowered.contains("pg_database") || lowered.contains("datname") {
        SystemQuery::DatabaseCatalog
    } else if lowered.contains("information_schema.tables") {
        SystemQuery::InformationSchemaTables
    } else {
        SystemQuery::Generic
    }
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Answers a SHOW statement locally. Resolution order: the fixed replies
/// every client probes for, then any value the session has SET, then the
/// literal string "unknown".
pub fn show_response(name: &str, session: &Session, server_version: &str) -> StatementResult {
    let lowered = name.to_ascii_lowercase();
    let value = match lowered.as_str() {
        "server_version" => server_version.to_string(),
        "server_encoding" | "client_encoding" => "UTF8".to_string(),
        "timezone" | "time zone" => "UTC".to_string(),
        "datestyle" => "ISO, MDY".to_string(),
        _ => session
            .get_parameter(&lowered)
            .map(str::to_string)
            .unwrap_or_else(|| "unknown".to_string()),
    };
    StatementResult::single(&lowered, &value)
}
