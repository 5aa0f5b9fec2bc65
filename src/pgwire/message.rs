// Pgwire protocol versions are represented as 32-bit integers, where the
// high 16 bits represent the major version and the low 16 bits represent the
// minor version.
//
// The protocol overloads the version field to indicate special types of
// connections, namely SSL connections and cancellation connections. These
// pseudo-versions were constructed to avoid ever matching a true protocol
// version.

use std::collections::HashMap;

use crate::pgrepr::{format_value, lookup_type, StatementResult};

pub const VERSION_3_MAJOR: i32 = 3;
pub const VERSION_SSL: i32 = (1234 << 16) + 5679;

/// A decoded frontend pgwire [message], representing instructions for the
/// gateway.
///
/// Startup-category messages (`Startup`, `SslRequest`) carry no type byte
/// on the wire and are only decoded while the connection is in its startup
/// phase; everything else is a typed frame.
///
/// [message]: https://www.postgresql.org/docs/current/protocol-message-formats.html
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// The first message a client sends, carrying the protocol version and
    /// session parameters such as `user` and `database`.
    Startup {
        version: i32,
        params: HashMap<String, String>,
    },
    /// Request SSL encryption for the connection.
    SslRequest,
    /// Execute the specified SQL via the simple query flow.
    Query { sql: String },
    /// Prepare a named statement (extended query flow).
    Parse {
        name: String,
        sql: String,
        param_types: Vec<u32>,
    },
    /// Bind a prepared statement to a portal.
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    /// Execute a bound portal.
    Execute { portal: String, max_rows: i32 },
    /// Describe a prepared statement or portal.
    Describe { target: Target, name: String },
    /// Close a prepared statement or portal.
    Close { target: Target, name: String },
    /// Synchronization point; the reply is ReadyForQuery.
    Sync,
    /// Graceful connection termination.
    Terminate,
    /// Cleartext password sent in response to an authentication request.
    Password { password: String },
    /// A frame with a type byte the gateway does not dispatch on. The
    /// payload has already been consumed; the ready state logs and ignores
    /// these.
    Unknown { tag: u8 },
    /// A frame whose payload failed to decode. The frame boundary held, so
    /// the stream is intact; the ready state reports the error and keeps
    /// the connection usable.
    Malformed { tag: u8, error: String },
}

/// The object of a Describe or Close message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

/// Internal representation of a backend [message].
///
/// [message]: https://www.postgresql.org/docs/current/protocol-message-formats.html
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<String>>),
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,
    ErrorResponse(ErrorResponse),
    NoticeResponse(ErrorResponse),
    ParseComplete,
    BindComplete,
    CloseComplete,
}

/// One column in a RowDescription message. Table oid, column attribute
/// number, type modifier and format code are fixed by the gateway (0, i+1,
/// -1, text) and filled in at encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: u32,
    pub type_size: i16,
}

impl FieldDescription {
    pub fn new(name: &str, type_name: &str) -> FieldDescription {
        let typ = lookup_type(type_name);
        FieldDescription {
            name: name.to_string(),
            type_oid: typ.oid,
            type_size: typ.size,
        }
    }
}

/// The transaction status byte carried in ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not currently in a transaction ('I').
    Idle,
    /// Currently in a transaction ('T').
    InTransaction,
    /// Currently in a transaction block which is failed ('E').
    Failed,
}

impl TransactionStatus {
    pub fn byte(&self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// A five-character PostgreSQL error classification code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqlState(&'static str);

impl SqlState {
    pub const PROTOCOL_VIOLATION: SqlState = SqlState("08P01");
    pub const CONNECTION_FAILURE: SqlState = SqlState("08006");
    pub const INVALID_PARAMETER_VALUE: SqlState = SqlState("22023");
    pub const INSUFFICIENT_PRIVILEGE: SqlState = SqlState("42501");
    pub const SYNTAX_ERROR: SqlState = SqlState("42601");
    pub const UNDEFINED_TABLE: SqlState = SqlState("42P01");
    pub const TOO_MANY_CONNECTIONS: SqlState = SqlState("53300");
    pub const QUERY_CANCELED: SqlState = SqlState("57014");
    pub const INTERNAL_ERROR: SqlState = SqlState("XX000");

    pub const fn new(code: &'static str) -> SqlState {
        SqlState(code)
    }

    pub fn code(&self) -> &'static str {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub severity: Severity,
    pub code: SqlState,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ErrorResponse {
    pub fn error<S>(code: SqlState, message: S) -> ErrorResponse
    where
        S: Into<String>,
    {
        ErrorResponse::new(Severity::Error, code, message)
    }

    pub fn fatal<S>(code: SqlState, message: S) -> ErrorResponse
    where
        S: Into<String>,
    {
        ErrorResponse::new(Severity::Fatal, code, message)
    }

    pub fn new<S>(severity: Severity, code: SqlState, message: S) -> ErrorResponse
    where
        S: Into<String>,
    {
        ErrorResponse {
            severity,
            code,
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn with_detail<S: Into<String>>(mut self, detail: S) -> ErrorResponse {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint<S: Into<String>>(mut self, hint: S) -> ErrorResponse {
        self.hint = Some(hint.into());
        self
    }
}

impl From<&crate::error::GatewayError> for ErrorResponse {
    fn from(err: &crate::error::GatewayError) -> Self {
        use crate::error::GatewayError;
        match err {
            GatewayError::Framing(desc) => {
                ErrorResponse::error(SqlState::PROTOCOL_VIOLATION, desc.clone())
            }
            GatewayError::Protocol(desc) => {
                ErrorResponse::fatal(SqlState::PROTOCOL_VIOLATION, desc.clone())
            }
            GatewayError::Backend(err) => err.to_error_response(),
            other => ErrorResponse::error(SqlState::INTERNAL_ERROR, other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Fatal,
    Error,
    Warning,
    Notice,
}

impl Severity {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Severity::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Notice => "NOTICE",
        }
    }
}

/// Composes the reply sequence for a normalized query result.
///
/// When the result carries column metadata the reply is RowDescription,
/// one DataRow per record and `CommandComplete("SELECT n")`. Without
/// columns but with an update count, the reply is a single CommandComplete
/// whose tag is the backend-supplied tag when present, `UPDATE n` when
/// rows were touched and `OK` otherwise. With neither, the reply is
/// EmptyQueryResponse. A ReadyForQuery carrying `txn` always closes the
/// sequence.
pub fn query_response(
    result: &StatementResult,
    txn: TransactionStatus,
) -> Vec<BackendMessage> {
    let mut out = Vec::with_capacity(result.rows.len() + 3);

    if !result.columns.is_empty() {
        let fields = result
            .columns
            .iter()
            .map(|c| FieldDescription::new(&c.name, &c.type_name))
            .collect();
        out.push(BackendMessage::RowDescription(fields));
        for row in &result.rows {
            let cols = row
                .iter()
                .map(|v| {
                    if v.is_null() {
                        None
                    } else {
                        Some(format_value(v))
                    }
                })
                .collect();
            out.push(BackendMessage::DataRow(cols));
        }
        out.push(BackendMessage::CommandComplete {
            tag: format!("SELECT {}", result.rows.len()),
        });
    } else if let Some(updated) = result.rows_updated {
        let tag = match &result.command_tag {
            Some(tag) => format!("{tag} {updated}"),
            None if updated > 0 => format!("UPDATE {updated}"),
            None => "OK".to_string(),
        };
        out.push(BackendMessage::CommandComplete { tag });
    } else {
        out.push(BackendMessage::EmptyQueryResponse);
    }

    out.push(BackendMessage::ReadyForQuery(txn));
    out
}
