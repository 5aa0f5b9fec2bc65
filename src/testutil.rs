//! A scripted [`SqlBackend`] for exercising the protocol layers without
//! an HTTP endpoint.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::warn;

use crate::dataapi::{BackendError, BackendErrorKind, SqlBackend};
use crate::pgrepr::{StatementResult, Value};

/// What the state machine asked the backend to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Execute(String),
    Begin,
    Commit,
    Rollback,
}

/// A backend whose `execute` replies are scripted up front and whose
/// transaction-identifier lifecycle matches the production client's
/// contract: at most one identifier, cleared before commit/rollback
/// returns even on failure.
#[derive(Default)]
pub struct ScriptedBackend {
    pub calls: Vec<BackendCall>,
    results: VecDeque<Result<StatementResult, BackendError>>,
    pub fail_next_begin: Option<BackendError>,
    pub fail_next_commit: Option<BackendError>,
    pub fail_next_rollback: Option<BackendError>,
    transaction_id: Option<String>,
    txn_counter: u32,
}

impl ScriptedBackend {
    pub fn new() -> ScriptedBackend {
        ScriptedBackend::default()
    }

    /// Queues the reply for the next `execute` call.
    pub fn push_result(&mut self, result: Result<StatementResult, BackendError>) {
        self.results.push_back(result);
    }

    /// The SQL of every `execute` call made so far.
    pub fn executed_sql(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Execute(sql) => Some(sql.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SqlBackend for ScriptedBackend {
    async fn execute(
        &mut self,
        sql: &str,
        _params: &[Value],
    ) -> Result<StatementResult, BackendError> {
        self.calls.push(BackendCall::Execute(sql.to_string()));
        self.results
            .pop_front()
            .unwrap_or_else(|| Ok(StatementResult::single("result", "ok")))
    }

    async fn begin_transaction(&mut self) -> Result<(), BackendError> {
        self.calls.push(BackendCall::Begin);
        if let Some(err) = self.fail_next_begin.take() {
            return Err(err);
        }
        if self.transaction_id.is_some() {
            return Err(BackendError::new(
                BackendErrorKind::Validation,
                "a transaction is already open on this connection",
            ));
        }
        self.txn_counter += 1;
        self.transaction_id = Some(format!("txn-{}", self.txn_counter));
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), BackendError> {
        self.calls.push(BackendCall::Commit);
        let _txn = self.transaction_id.take().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Validation,
                "no transaction is open on this connection",
            )
        })?;
        if let Some(err) = self.fail_next_commit.take() {
            return Err(err);
        }
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<(), BackendError> {
        self.calls.push(BackendCall::Rollback);
        let _txn = self.transaction_id.take().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Validation,
                "no transaction is open on this connection",
            )
        })?;
        if let Some(err) = self.fail_next_rollback.take() {
            return Err(err);
        }
        Ok(())
    }

    fn is_in_transaction(&self) -> bool {
        self.transaction_id.is_some()
    }

    fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    async fn cleanup(&mut self) {
        if self.is_in_transaction() {
            if let Err(e) = self.rollback_transaction().await {
                warn!(error = %e, "rollback during cleanup failed");
            }
        }
    }
}
