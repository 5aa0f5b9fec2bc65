//! Client for the remote HTTP SQL execution service.
//!
//! The service is a request/response HTTPS API with four operations:
//! execute-statement, begin-transaction, commit-transaction and
//! rollback-transaction. Statements carry named parameters tagged by wire
//! type; results come back as arrays of tagged field values plus column
//! metadata. This module owns the transaction-identifier lifecycle and the
//! normalization of responses into [`StatementResult`].

use async_trait::async_trait;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::pgrepr::{ColumnDesc, StatementResult, Value};
use crate::pgwire::message::{ErrorResponse, Severity, SqlState};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

/// The seam between the protocol state machine and the remote SQL
/// service. Production uses [`DataApiClient`]; protocol tests script this
/// trait instead of standing up an HTTP endpoint.
#[async_trait]
pub trait SqlBackend: Send {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<StatementResult, BackendError>;

    /// Opens a transaction. Fails if one is already open.
    async fn begin_transaction(&mut self) -> Result<(), BackendError>;

    /// Commits the open transaction. Fails if none is open. The held
    /// identifier is cleared before this returns, even on failure.
    async fn commit_transaction(&mut self) -> Result<(), BackendError>;

    /// Rolls back the open transaction, with the same contract as
    /// [`SqlBackend::commit_transaction`].
    async fn rollback_transaction(&mut self) -> Result<(), BackendError>;

    fn is_in_transaction(&self) -> bool;

    fn transaction_id(&self) -> Option<&str>;

    /// Rolls back any open transaction, swallowing but logging errors.
    /// Called on connection teardown.
    async fn cleanup(&mut self);
}

/// Connection settings for the SQL service, resolved from gateway
/// configuration at startup.
#[derive(Debug, Clone)]
pub struct DataApiConfig {
    /// Base URL of the service, e.g. `https://sql.us-east-1.example.com`.
    pub endpoint: String,
    pub resource_arn: String,
    pub secret_arn: String,
    pub database: String,
}

/// A failure reported by (or while reaching) the SQL service, carrying
/// the PostgreSQL classification the client will see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    BadRequest,
    Forbidden,
    ServiceUnavailable,
    StatementTimeout,
    ResourceNotFound,
    Validation,
    Throttling,
    Internal,
}

impl BackendError {
    pub fn new<S: Into<String>>(kind: BackendErrorKind, message: S) -> BackendError {
        BackendError {
            kind,
            message: message.into(),
        }
    }

    fn from_transport(err: &reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::new(BackendErrorKind::StatementTimeout, err.to_string())
        } else {
            BackendError::new(BackendErrorKind::ServiceUnavailable, err.to_string())
        }
    }

    /// Error names the service uses, mapped onto kinds. Anything
    /// unrecognized is an internal error.
    fn from_error_name(name: &str, message: String) -> BackendError {
        let kind = if name.contains("BadRequest") {
            BackendErrorKind::BadRequest
        } else if name.contains("Forbidden") || name.contains("AccessDenied") {
            BackendErrorKind::Forbidden
        } else if name.contains("ServiceUnavailable") {
            BackendErrorKind::ServiceUnavailable
        } else if name.contains("StatementTimeout") {
            BackendErrorKind::StatementTimeout
        } else if name.contains("NotFound") {
            BackendErrorKind::ResourceNotFound
        } else if name.contains("Validation") {
            BackendErrorKind::Validation
        } else if name.contains("Throttling") || name.contains("TooManyRequests") {
            BackendErrorKind::Throttling
        } else {
            BackendErrorKind::Internal
        };
        BackendError { kind, message }
    }

    /// Transport errors (including timeouts), throttling, and 5xx-class
    /// failures are worth another attempt; the caller's statement has not
    /// observably executed for any of them.
    fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::ServiceUnavailable
                | BackendErrorKind::Throttling
                | BackendErrorKind::StatementTimeout
                | BackendErrorKind::Internal
        )
    }

    pub fn sqlstate(&self) -> SqlState {
        match self.kind {
            BackendErrorKind::BadRequest => SqlState::SYNTAX_ERROR,
            BackendErrorKind::Forbidden => SqlState::INSUFFICIENT_PRIVILEGE,
            BackendErrorKind::ServiceUnavailable => SqlState::CONNECTION_FAILURE,
            BackendErrorKind::StatementTimeout => SqlState::QUERY_CANCELED,
            BackendErrorKind::ResourceNotFound => SqlState::UNDEFINED_TABLE,
            BackendErrorKind::Validation => SqlState::INVALID_PARAMETER_VALUE,
            BackendErrorKind::Throttling => SqlState::TOO_MANY_CONNECTIONS,
            BackendErrorKind::Internal => SqlState::INTERNAL_ERROR,
        }
    }

    pub fn severity(&self) -> Severity {
        match self.kind {
            BackendErrorKind::ServiceUnavailable => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// A hint derived from simple keyword matches on the message.
    pub fn hint(&self) -> Option<&'static str> {
        let lowered = self.message.to_ascii_lowercase();
        if lowered.contains("syntax") {
            Some("Check the SQL statement syntax.")
        } else if lowered.contains("permission") || lowered.contains("not authorized") {
            Some("Verify that the configured credentials may access the database.")
        } else if lowered.contains("timeout") || lowered.contains("timed out") {
            Some("The statement exceeded the backend time limit; simplify it or retry.")
        } else if lowered.contains("does not exist") || lowered.contains("not found") {
            Some("Verify that the referenced object exists in the target database.")
        } else if lowered.contains("connection") {
            Some("The SQL endpoint may be paused or unreachable; retry shortly.")
        } else {
            None
        }
    }

    /// The wire-level error carrying the original message as both message
    /// and detail.
    pub fn to_error_response(&self) -> ErrorResponse {
        let mut resp = ErrorResponse::new(self.severity(), self.sqlstate(), self.message.clone())
            .with_detail(self.message.clone());
        if let Some(hint) = self.hint() {
            resp = resp.with_hint(hint);
        }
        resp
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BackendError {}

/// A statement parameter or result field in the service's tagged-union
/// wire representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum WireField {
    IsNull(bool),
    StringValue(String),
    LongValue(i64),
    DoubleValue(f64),
    BooleanValue(bool),
    /// Base64-encoded bytes.
    BlobValue(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SqlParameter {
    pub name: String,
    pub value: WireField,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest<'a> {
    resource_arn: &'a str,
    secret_arn: &'a str,
    database: &'a str,
    sql: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parameters: Vec<SqlParameter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<&'a str>,
    include_result_metadata: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BeginRequest<'a> {
    resource_arn: &'a str,
    secret_arn: &'a str,
    database: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionEndRequest<'a> {
    resource_arn: &'a str,
    secret_arn: &'a str,
    transaction_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    #[serde(default)]
    records: Option<Vec<Vec<WireField>>>,
    #[serde(default)]
    column_metadata: Option<Vec<WireColumn>>,
    #[serde(default)]
    number_of_records_updated: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireColumn {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    type_name: Option<String>,
    #[serde(default)]
    nullable: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BeginResponse {
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[allow(dead_code)]
    #[serde(rename = "transactionStatus", default)]
    transaction_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "__type", default)]
    error_type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// The production [`SqlBackend`]: one HTTP client per connection, so
/// transaction identifiers are strictly per-connection state.
pub struct DataApiClient {
    http: reqwest::Client,
    config: DataApiConfig,
    transaction_id: Option<String>,
}

impl DataApiClient {
    pub fn new(config: DataApiConfig) -> crate::error::Result<DataApiClient> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| crate::error::GatewayError::External(Box::new(e)))?;
        Ok(DataApiClient {
            http,
            config,
            transaction_id: None,
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        operation: &str,
        body: &impl Serialize,
    ) -> Result<T, BackendError> {
        let url = format!(
            "{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            operation
        );
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.http.post(&url).json(body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json::<T>().await.map_err(|e| {
                        BackendError::new(
                            BackendErrorKind::Internal,
                            format!("malformed backend response: {e}"),
                        )
                    });
                }
                Ok(resp) => Self::error_from_response(resp).await,
                Err(e) => BackendError::from_transport(&e),
            };
            if attempt < MAX_ATTEMPTS && outcome.is_retryable() {
                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                debug!(operation, attempt, ?backoff, "retrying backend call");
                tokio::time::sleep(backoff).await;
                continue;
            }
            return Err(outcome);
        }
    }

    async fn error_from_response(resp: reqwest::Response) -> BackendError {
        let status = resp.status();
        let header_name = resp
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: Option<ApiErrorBody> = resp.json().await.ok();
        let (body_type, message) = match body {
            Some(b) => (
                b.error_type,
                b.message.unwrap_or_else(|| format!("backend returned {status}")),
            ),
            None => (None, format!("backend returned {status}")),
        };
        let name = header_name
            .or(body_type)
            .unwrap_or_else(|| status_fallback_name(status).to_string());
        BackendError::from_error_name(&name, message)
    }
}

fn status_fallback_name(status: reqwest::StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "BadRequestException",
        403 => "ForbiddenException",
        404 => "NotFoundException",
        429 => "ThrottlingException",
        503 => "ServiceUnavailableError",
        _ => "InternalServerErrorException",
    }
}

#[async_trait]
impl SqlBackend for DataApiClient {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<StatementResult, BackendError> {
        let request = ExecuteRequest {
            resource_arn: &self.config.resource_arn,
            secret_arn: &self.config.secret_arn,
            database: &self.config.database,
            sql,
            parameters: tag_parameters(params),
            transaction_id: self.transaction_id.as_deref(),
            include_result_metadata: true,
        };
        let response: ExecuteResponse = self.post("Execute", &request).await?;
        Ok(normalize_response(response))
    }

    async fn begin_transaction(&mut self) -> Result<(), BackendError> {
        if self.transaction_id.is_some() {
            return Err(BackendError::new(
                BackendErrorKind::Validation,
                "a transaction is already open on this connection",
            ));
        }
        let request = BeginRequest {
            resource_arn: &self.config.resource_arn,
            secret_arn: &self.config.secret_arn,
            database: &self.config.database,
        };
        let response: BeginResponse = self.post("BeginTransaction", &request).await?;
        debug!(txn = %response.transaction_id, "transaction opened");
        self.transaction_id = Some(response.transaction_id);
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), BackendError> {
        // take() clears the identifier before any return path, so a failed
        // commit cannot leave the connection believing it is still in a
        // transaction.
        let txn = self.transaction_id.take().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Validation,
                "no transaction is open on this connection",
            )
        })?;
        let request = TransactionEndRequest {
            resource_arn: &self.config.resource_arn,
            secret_arn: &self.config.secret_arn,
            transaction_id: &txn,
        };
        let _: CommitResponse = self.post("CommitTransaction", &request).await?;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<(), BackendError> {
        let txn = self.transaction_id.take().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Validation,
                "no transaction is open on this connection",
            )
        })?;
        let request = TransactionEndRequest {
            resource_arn: &self.config.resource_arn,
            secret_arn: &self.config.secret_arn,
            transaction_id: &txn,
        };
        let _: CommitResponse = self.post("RollbackTransaction", &request).await?;
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

/// Tags statement parameters `param1..paramN` by wire type.
pub fn tag_parameters(params: &[Value]) -> Vec<SqlParameter> {
    params
        .iter()
        .enumerate()
        .map(|(i, v)| SqlParameter {
            name: format!("param{}", i + 1),
            value: tag_value(v),
        })
        .collect()
}

fn tag_value(value: &Value) -> WireField {
    match value {
        Value::Null => WireField::IsNull(true),
        Value::Text(s) => WireField::StringValue(s.clone()),
        // Integers in signed-32 range travel as longValue; anything wider
        // degrades to doubleValue, matching the service's numeric model.
        Value::Int(i) if i32::try_from(*i).is_ok() => WireField::LongValue(*i),
        Value::Int(i) => WireField::DoubleValue(*i as f64),
        Value::Float(f) => WireField::DoubleValue(*f),
        Value::Bool(b) => WireField::BooleanValue(*b),
        Value::Date(d) => WireField::StringValue(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => WireField::StringValue(ts.to_rfc3339()),
        Value::Bytes(b) => {
            WireField::BlobValue(base64::engine::general_purpose::STANDARD.encode(b))
        }
        Value::Json(v) => WireField::StringValue(v.to_string()),
    }
}

/// Unpacks one tagged field into a typed scalar. JSON-typed columns have
/// their payload parsed so clients receive serialized JSON text rather
/// than a doubly-quoted string.
fn unpack_field(field: WireField, type_name: &str) -> Value {
    match field {
        WireField::IsNull(true) => Value::Null,
        WireField::IsNull(false) => Value::Null,
        WireField::StringValue(s) => {
            if type_name.eq_ignore_ascii_case("json") || type_name.eq_ignore_ascii_case("jsonb") {
                match serde_json::from_str(&s) {
                    Ok(v) => Value::Json(v),
                    Err(_) => Value::Text(s),
                }
            } else {
                Value::Text(s)
            }
        }
        WireField::LongValue(i) => Value::Int(i),
        WireField::DoubleValue(f) => Value::Float(f),
        WireField::BooleanValue(b) => Value::Bool(b),
        WireField::BlobValue(b64) => match base64::engine::general_purpose::STANDARD.decode(&b64) {
            Ok(bytes) => Value::Bytes(bytes),
            Err(_) => Value::Text(b64),
        },
    }
}

fn normalize_response(response: ExecuteResponse) -> StatementResult {
    let records = response.records.unwrap_or_default();

    let mut columns: Vec<ColumnDesc> = response
        .column_metadata
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, c)| ColumnDesc {
            name: c.name.unwrap_or_else(|| format!("column{}", i + 1)),
            type_name: c.type_name.unwrap_or_else(|| "text".to_string()),
            nullable: c.nullable.unwrap_or(1) != 0,
        })
        .collect();
    // A result set without metadata still needs a RowDescription.
    if columns.is_empty() {
        if let Some(first) = records.first() {
            columns = (0..first.len())
                .map(|i| ColumnDesc::new(format!("column{}", i + 1), "text"))
                .collect();
        }
    }

    let rows = records
        .into_iter()
        .map(|record| {
            record
                .into_iter()
                .enumerate()
                .map(|(i, field)| {
                    let type_name = columns.get(i).map(|c| c.type_name.as_str()).unwrap_or("text");
                    unpack_field(field, type_name)
                })
                .collect()
        })
        .collect();

    StatementResult {
        columns,
        rows,
        rows_updated: response.number_of_records_updated,
        command_tag: None,
    }
}
