//! Per-connection session state. Never shared across connections.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// A session holds per-connection state: parameters applied with SET,
/// statements remembered from Parse, and the transaction flag.
///
/// The flag mirrors the backend client's transaction-id presence at every
/// quiescent point, i.e. whenever the previous reply has been sent and no
/// message is being processed.
#[derive(Debug, Clone)]
pub struct Session {
    conn_id: u32,
    params: HashMap<String, String>,
    prepared: HashMap<String, PreparedStatement>,
    in_transaction: bool,
}

/// A statement remembered from a Parse message. The gateway never
/// forwards Parse to the backend; the text is kept so a later Execute or
/// introspection can see it.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    pub sql: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(conn_id: u32) -> Session {
        Session {
            conn_id,
            params: HashMap::new(),
            prepared: HashMap::new(),
            in_transaction: false,
        }
    }

    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    /// Stores a parameter. Names are lower-cased so that `SET TimeZone`
    /// and `SHOW timezone` agree.
    pub fn set_parameter(&mut self, name: &str, value: &str) {
        self.params
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn get_parameter(&self, name: &str) -> Option<&str> {
        self.params.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn put_prepared_statement(&mut self, name: &str, sql: &str) {
        self.prepared.insert(
            name.to_string(),
            PreparedStatement {
                sql: sql.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn get_prepared_statement(&self, name: &str) -> Option<&PreparedStatement> {
        self.prepared.get(name)
    }

    pub fn delete_prepared_statement(&mut self, name: &str) {
        self.prepared.remove(name);
    }

    pub fn mark_transaction_begin(&mut self) {
        self.in_transaction = true;
    }

    pub fn mark_transaction_end(&mut self) {
        self.in_transaction = false;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// A structural copy for introspection (health surface, logging).
    pub fn snapshot(&self) -> Session {
        self.clone()
    }
}
