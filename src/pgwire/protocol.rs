//! The per-connection protocol state machine.
//!
//! One machine drives one client from the unauthenticated startup state
//! to the idle query-accepting state and, eventually, to termination.
//! Messages are processed strictly in FIFO order, one at a time; the
//! ReadyForQuery boundary is where the client observes state changes.

use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::classify::{self, QueryClass, TransactionControl};
use crate::dataapi::SqlBackend;
use crate::error::{GatewayError, Result};
use crate::pgwire::codec::FramedConn;
use crate::pgwire::message::{
    query_response, BackendMessage, ErrorResponse, FrontendMessage, SqlState, Target,
    TransactionStatus,
};
use crate::session::Session;
use crate::system;

/// Time allowed between client messages before the connection is
/// destroyed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection-independent settings the machine needs: the advertised
/// database name and server version strings.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub database: String,
    pub server_version: String,
    pub version_banner: String,
}

/// The protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Startup,
    Authentication,
    Ready,
    Terminated,
}

/// Drives a connection to completion. Returns `Ok` when the client
/// terminated (or the stream ended, or shutdown was signalled) and `Err`
/// when a protocol violation or write failure destroyed the connection;
/// either way any open backend transaction has been rolled back
/// best-effort.
pub async fn run<A, B>(
    conn: &mut FramedConn<A>,
    backend: &mut B,
    settings: ProtocolSettings,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Send + Sync + Unpin,
    B: SqlBackend,
{
    let session = Session::new(conn.conn_id());
    let machine = StateMachine {
        conn,
        backend,
        session,
        settings,
        shutdown,
        state: ConnState::Startup,
    };
    machine.run().await
}

struct StateMachine<'a, A, B> {
    conn: &'a mut FramedConn<A>,
    backend: &'a mut B,
    session: Session,
    settings: ProtocolSettings,
    shutdown: watch::Receiver<bool>,
    state: ConnState,
}

impl<'a, A, B> StateMachine<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Send + Sync + Unpin,
    B: SqlBackend,
{
    async fn run(mut self) -> Result<()> {
        loop {
            let result = match self.state {
                ConnState::Startup => self.advance_startup().await,
                ConnState::Authentication => self.advance_authentication().await,
                ConnState::Ready => self.advance_ready().await,
                ConnState::Terminated => return Ok(()),
            };
            if let Err(e) = result {
                // The connection is being destroyed; do not leave a
                // transaction open on the backend.
                self.backend.cleanup().await;
                return Err(e);
            }
        }
    }

    /// Receives the next message, bounded by the idle timeout and the
    /// process-wide shutdown signal. `None` means the connection should
    /// wind down gracefully.
    async fn recv(&mut self) -> Result<Option<FrontendMessage>> {
        let conn_id = self.conn.conn_id();
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.changed() => {
                info!(conn_id, "shutdown signalled, closing connection");
                Ok(None)
            }
            message = tokio::time::timeout(IDLE_TIMEOUT, self.conn.recv()) => match message {
                Ok(message) => message,
                Err(_) => {
                    info!(conn_id, "idle timeout, closing connection");
                    Ok(None)
                }
            }
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        self.backend.cleanup().await;
        self.state = ConnState::Terminated;
        Ok(())
    }

    async fn advance_startup(&mut self) -> Result<()> {
        match self.recv().await? {
            None => self.terminate().await,
            Some(FrontendMessage::SslRequest) => {
                // One byte `N`: no SSL, carry on in cleartext. Remain in
                // startup; the real startup message follows.
                self.conn.reject_encryption().await
            }
            Some(FrontendMessage::Startup { version, params }) => {
                info!(
                    conn_id = self.conn.conn_id(),
                    version = version >> 16,
                    user = params.get("user").map(String::as_str).unwrap_or(""),
                    database = params.get("database").map(String::as_str).unwrap_or(""),
                    "startup"
                );
                for (name, value) in &params {
                    self.session.set_parameter(name, value);
                }
                self.conn
                    .send(BackendMessage::AuthenticationCleartextPassword)
                    .await?;
                self.conn.flush().await?;
                self.state = ConnState::Authentication;
                Ok(())
            }
            Some(other) => Err(GatewayError::protocol(format!(
                "unexpected message during startup: {other:?}"
            ))),
        }
    }

    async fn advance_authentication(&mut self) -> Result<()> {
        match self.recv().await? {
            None => self.terminate().await,
            // Password verification is delegated to the backend's own
            // credential store; any password is accepted here.
            Some(FrontendMessage::Password { .. }) => {
                let mut buf = vec![
                    BackendMessage::AuthenticationOk,
                    BackendMessage::BackendKeyData {
                        process_id: std::process::id() as i32,
                        secret_key: rand::thread_rng().gen(),
                    },
                ];
                for (name, value) in self.default_parameters() {
                    buf.push(BackendMessage::ParameterStatus { name, value });
                }
                buf.push(BackendMessage::ReadyForQuery(TransactionStatus::Idle));
                self.conn.send_all(buf).await?;
                self.conn.flush().await?;
                self.state = ConnState::Ready;
                Ok(())
            }
            Some(other) => Err(GatewayError::protocol(format!(
                "unexpected message during authentication: {other:?}"
            ))),
        }
    }

    /// The parameter-status set advertised after authentication.
    fn default_parameters(&self) -> Vec<(String, String)> {
        let user = self
            .session
            .get_parameter("user")
            .unwrap_or("postgres")
            .to_string();
        let application_name = self
            .session
            .get_parameter("application_name")
            .unwrap_or("")
            .to_string();
        vec![
            ("server_version".into(), self.settings.server_version.clone()),
            ("server_encoding".into(), "UTF8".into()),
            ("client_encoding".into(), "UTF8".into()),
            ("application_name".into(), application_name),
            ("is_superuser".into(), "off".into()),
            ("session_authorization".into(), user),
            ("DateStyle".into(), "ISO, MDY".into()),
            ("IntervalStyle".into(), "postgres".into()),
            ("TimeZone".into(), "UTC".into()),
            ("integer_datetimes".into(), "on".into()),
            ("standard_conforming_strings".into(), "on".into()),
        ]
    }

    async fn advance_ready(&mut self) -> Result<()> {
        let message = match self.recv().await {
            Ok(message) => message,
            // A framing error at the frame-header level loses message
            // sync; report it and close rather than re-reading a stream
            // whose boundaries can no longer be trusted. (Malformed
            // payloads inside a well-delimited frame arrive as
            // `FrontendMessage::Malformed` and are recoverable.)
            Err(GatewayError::Framing(desc)) => {
                warn!(conn_id = self.conn.conn_id(), error = %desc, "framing error, closing");
                let err = ErrorResponse::error(SqlState::PROTOCOL_VIOLATION, desc);
                self.conn
                    .send_all([
                        BackendMessage::ErrorResponse(err),
                        BackendMessage::ReadyForQuery(self.txn_status()),
                    ])
                    .await?;
                self.conn.flush().await?;
                return self.terminate().await;
            }
            Err(e) => return Err(e),
        };

        match message {
            None => self.terminate().await,
            Some(FrontendMessage::Query { sql }) => self.query(sql).await,
            Some(FrontendMessage::Parse { name, sql, .. }) => {
                // No backend parse is performed; the statement text is
                // remembered so Execute and introspection can see it.
                self.session.put_prepared_statement(&name, &sql);
                self.send_and_flush(BackendMessage::ParseComplete).await
            }
            Some(FrontendMessage::Bind { .. }) => {
                // Bind parameters are accepted but not validated against
                // the prior parse.
                self.send_and_flush(BackendMessage::BindComplete).await
            }
            Some(FrontendMessage::Describe { .. }) => {
                // Deliberately minimal: no column metadata is available
                // without a backend round-trip.
                self.send_and_flush(BackendMessage::RowDescription(vec![])).await
            }
            Some(FrontendMessage::Execute { .. }) => {
                // No ReadyForQuery here; the client's Sync supplies it.
                self.send_and_flush(BackendMessage::EmptyQueryResponse).await
            }
            Some(FrontendMessage::Close { target, name }) => {
                if target == Target::Statement {
                    self.session.delete_prepared_statement(&name);
                }
                self.send_and_flush(BackendMessage::CloseComplete).await
            }
            Some(FrontendMessage::Sync) => {
                let status = self.txn_status();
                self.send_and_flush(BackendMessage::ReadyForQuery(status)).await
            }
            Some(FrontendMessage::Terminate) => self.terminate().await,
            Some(FrontendMessage::Malformed { tag, error }) => {
                warn!(conn_id = self.conn.conn_id(), tag = %char::from(tag), error = %error, "malformed message");
                let err = ErrorResponse::error(SqlState::PROTOCOL_VIOLATION, error);
                self.conn
                    .send_all([
                        BackendMessage::ErrorResponse(err),
                        BackendMessage::ReadyForQuery(self.txn_status()),
                    ])
                    .await?;
                self.conn.flush().await
            }
            Some(other) => {
                warn!(conn_id = self.conn.conn_id(), message = ?other, "ignoring unexpected message");
                Ok(())
            }
        }
    }

    async fn send_and_flush(&mut self, message: BackendMessage) -> Result<()> {
        self.conn.send(message).await?;
        self.conn.flush().await
    }

    fn txn_status(&self) -> TransactionStatus {
        if self.backend.is_in_transaction() {
            TransactionStatus::InTransaction
        } else {
            TransactionStatus::Idle
        }
    }

    /// One simple-query exchange: classify, execute locally or remotely,
    /// reply. Backend failures become an ErrorResponse followed by
    /// ReadyForQuery; the connection survives unless the error is fatal.
    async fn query(&mut self, sql: String) -> Result<()> {
        debug!(conn_id = self.conn.conn_id(), sql = %sql, "query");
        let messages = match classify::classify(&sql) {
            QueryClass::Empty => vec![
                BackendMessage::EmptyQueryResponse,
                BackendMessage::ReadyForQuery(self.txn_status()),
            ],
            QueryClass::Transaction(TransactionControl::Begin) => self.begin().await,
            QueryClass::Transaction(TransactionControl::Commit) => {
                self.end_transaction(TransactionControl::Commit).await
            }
            QueryClass::Transaction(TransactionControl::Rollback) => {
                self.end_transaction(TransactionControl::Rollback).await
            }
            QueryClass::Set { name, value } => {
                self.session.set_parameter(&name, &value);
                vec![
                    BackendMessage::CommandComplete { tag: "SET".into() },
                    BackendMessage::ReadyForQuery(self.txn_status()),
                ]
            }
            QueryClass::Show { name } => {
                let result =
                    classify::show_response(&name, &self.session, &self.settings.server_version);
                query_response(&result, self.txn_status())
            }
            QueryClass::System(kind) => {
                let result = system::respond(
                    &sql,
                    kind,
                    &mut *self.backend,
                    &self.settings.database,
                    &self.settings.version_banner,
                )
                .await;
                query_response(&result, self.txn_status())
            }
            QueryClass::Forward => match self.backend.execute(&sql, &[]).await {
                Ok(result) => query_response(&result, self.txn_status()),
                Err(e) => self.error_messages(e.to_error_response()),
            },
        };

        let fatal = messages.iter().any(|m| {
            matches!(m, BackendMessage::ErrorResponse(err) if err.severity.is_fatal())
        });
        self.conn.send_all(messages).await?;
        self.conn.flush().await?;
        if fatal {
            // The client is expected to close after a fatal error; the
            // server reciprocates.
            self.terminate().await?;
        }
        Ok(())
    }

    async fn begin(&mut self) -> Vec<BackendMessage> {
        if !self.backend.is_in_transaction() {
            if let Err(e) = self.backend.begin_transaction().await {
                self.session.mark_transaction_end();
                return self.error_messages(e.to_error_response());
            }
        }
        self.session.mark_transaction_begin();
        vec![
            BackendMessage::CommandComplete { tag: "BEGIN".into() },
            BackendMessage::ReadyForQuery(TransactionStatus::InTransaction),
        ]
    }

    /// COMMIT and ROLLBACK share a contract: the backend call happens only
    /// when a transaction is actually open, and the session flag clears no
    /// matter how the call went.
    async fn end_transaction(&mut self, control: TransactionControl) -> Vec<BackendMessage> {
        let outcome = if self.backend.is_in_transaction() {
            match control {
                TransactionControl::Commit => self.backend.commit_transaction().await,
                _ => self.backend.rollback_transaction().await,
            }
        } else {
            Ok(())
        };
        self.session.mark_transaction_end();
        match outcome {
            Ok(()) => {
                let tag = match control {
                    TransactionControl::Commit => "COMMIT",
                    _ => "ROLLBACK",
                };
                vec![
                    BackendMessage::CommandComplete { tag: tag.into() },
                    BackendMessage::ReadyForQuery(TransactionStatus::Idle),
                ]
            }
            Err(e) => self.error_messages(e.to_error_response()),
        }
    }

    fn error_messages(&self, err: ErrorResponse) -> Vec<BackendMessage> {
        if err.severity.is_fatal() {
            // No ReadyForQuery after a fatal error; the connection is
            // about to close.
            vec![BackendMessage::ErrorResponse(err)]
        } else {
            vec![
                BackendMessage::ErrorResponse(err),
                BackendMessage::ReadyForQuery(self.txn_status()),
            ]
        }
    }
}
