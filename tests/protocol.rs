//! End-to-end protocol exchanges over an in-memory stream, with the
//! backend scripted.

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use pggate::dataapi::{BackendError, BackendErrorKind, SqlBackend};
use pggate::pgrepr::{ColumnDesc, StatementResult, Value};
use pggate::pgwire::codec::FramedConn;
use pggate::pgwire::protocol::{run, ProtocolSettings};
use pggate::testutil::{BackendCall, ScriptedBackend};
use pggate::GatewayError;

const BANNER: &str = "PostgreSQL 14.9 on x86_64-pc-linux-gnu (pggate), 64-bit";

fn spawn_gateway(
    backend: ScriptedBackend,
) -> (
    TestClient,
    JoinHandle<(Result<(), GatewayError>, ScriptedBackend)>,
    watch::Sender<bool>,
) {
    let (client, server) = duplex(64 * 1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let settings = ProtocolSettings {
        database: "db".to_string(),
        server_version: "14.9".to_string(),
        version_banner: BANNER.to_string(),
    };
    let handle = tokio::spawn(async move {
        let mut backend = backend;
        let mut conn = FramedConn::new(1, server);
        let result = run(&mut conn, &mut backend, settings, shutdown_rx).await;
        (result, backend)
    });
    (TestClient { stream: client }, handle, shutdown_tx)
}

struct TestClient {
    stream: DuplexStream,
}

impl TestClient {
    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn send_ssl_request(&mut self) {
        let mut frame = 8i32.to_be_bytes().to_vec();
        frame.extend_from_slice(&(((1234 << 16) + 5679) as i32).to_be_bytes());
        self.send_raw(&frame).await;
    }

    async fn send_startup(&mut self, params: &[(&str, &str)]) {
        let mut payload = vec![0x00, 0x03, 0x00, 0x00];
        for (k, v) in params {
            payload.extend_from_slice(k.as_bytes());
            payload.push(0);
            payload.extend_from_slice(v.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        let mut frame = ((payload.len() + 4) as i32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);
        self.send_raw(&frame).await;
    }

    async fn send_frame(&mut self, tag: u8, payload: &[u8]) {
        let mut frame = vec![tag];
        frame.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(payload);
        self.send_raw(&frame).await;
    }

    async fn send_password(&mut self, password: &str) {
        let mut payload = password.as_bytes().to_vec();
        payload.push(0);
        self.send_frame(b'p', &payload).await;
    }

    async fn send_query(&mut self, sql: &str) {
        let mut payload = sql.as_bytes().to_vec();
        payload.push(0);
        self.send_frame(b'Q', &payload).await;
    }

    async fn send_terminate(&mut self) {
        self.send_frame(b'X', b"").await;
    }

    async fn read_byte(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte).await.unwrap();
        byte[0]
    }

    /// Reads one backend message: (type byte, payload past the length).
    async fn read_message(&mut self) -> (u8, Vec<u8>) {
        let tag = self.read_byte().await;
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await.unwrap();
        let len = i32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).await.unwrap();
        (tag, payload)
    }

    /// Collects messages up to and including ReadyForQuery.
    async fn read_until_ready(&mut self) -> Vec<(u8, Vec<u8>)> {
        let mut messages = Vec::new();
        loop {
            let message = self.read_message().await;
            let done = message.0 == b'Z';
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    /// Runs the full startup/authentication handshake.
    async fn handshake(&mut self) {
        self.send_startup(&[("user", "alice"), ("database", "db")])
            .await;
        let (tag, payload) = self.read_message().await;
        assert_eq!(tag, b'R');
        assert_eq!(payload, 3i32.to_be_bytes());
        self.send_password("x").await;
        let messages = self.read_until_ready().await;
        assert_auth_sequence(&messages);
    }
}

fn assert_auth_sequence(messages: &[(u8, Vec<u8>)]) {
    assert_eq!(messages[0].0, b'R');
    assert_eq!(messages[0].1, 0i32.to_be_bytes());
    assert_eq!(messages[1].0, b'K');
    let statuses = messages.iter().filter(|(tag, _)| *tag == b'S').count();
    assert!(statuses >= 1, "expected at least one ParameterStatus");
    let (tag, payload) = messages.last().unwrap();
    assert_eq!(*tag, b'Z');
    assert_eq!(payload, b"I");
}

/// Parses the column names out of a RowDescription payload.
fn row_description_names(payload: &[u8]) -> Vec<String> {
    let count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut names = Vec::with_capacity(count);
    let mut at = 2;
    for _ in 0..count {
        let end = payload[at..].iter().position(|b| *b == 0).unwrap() + at;
        names.push(String::from_utf8(payload[at..end].to_vec()).unwrap());
        // name NUL, table oid, attnum, type oid, size, typmod, format
        at = end + 1 + 4 + 2 + 4 + 2 + 4 + 2;
    }
    names
}

/// Parses a DataRow payload into column values (None for NULL).
fn data_row_values(payload: &[u8]) -> Vec<Option<String>> {
    let count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut values = Vec::with_capacity(count);
    let mut at = 2;
    for _ in 0..count {
        let len = i32::from_be_bytes(payload[at..at + 4].try_into().unwrap());
        at += 4;
        if len == -1 {
            values.push(None);
        } else {
            let len = len as usize;
            values.push(Some(
                String::from_utf8(payload[at..at + len].to_vec()).unwrap(),
            ));
            at += len;
        }
    }
    values
}

fn command_tag(payload: &[u8]) -> String {
    String::from_utf8(payload[..payload.len() - 1].to_vec()).unwrap()
}

#[tokio::test]
async fn test_ssl_request_gets_single_n_byte() {
    let (mut client, handle, _shutdown) = spawn_gateway(ScriptedBackend::new());
    client.send_ssl_request().await;
    assert_eq!(client.read_byte().await, b'N');
    // The connection carries on: the startup handshake still works.
    client.handshake().await;
    client.send_terminate().await;
    let (result, _) = handle.await.unwrap();
    result.unwrap();
}

#[tokio::test]
async fn test_startup_and_authentication() {
    let (mut client, handle, _shutdown) = spawn_gateway(ScriptedBackend::new());
    client.handshake().await;
    client.send_terminate().await;
    let (result, backend) = handle.await.unwrap();
    result.unwrap();
    assert!(backend.calls.is_empty());
}

#[tokio::test]
async fn test_select_version_is_local() {
    let (mut client, handle, _shutdown) = spawn_gateway(ScriptedBackend::new());
    client.handshake().await;

    client.send_query("SELECT version()").await;
    let messages = client.read_until_ready().await;
    assert_eq!(row_description_names(&messages[0].1), vec!["version"]);
    assert_eq!(messages[1].0, b'D');
    assert_eq!(
        data_row_values(&messages[1].1),
        vec![Some(BANNER.to_string())]
    );
    assert_eq!(messages[2].0, b'C');
    assert_eq!(command_tag(&messages[2].1), "SELECT 1");
    assert_eq!(messages[3].1, b"I");

    client.send_terminate().await;
    let (result, backend) = handle.await.unwrap();
    result.unwrap();
    assert!(backend.calls.is_empty(), "no backend call may be made");
}

#[tokio::test]
async fn test_transaction_round_trip() {
    let mut backend = ScriptedBackend::new();
    backend.push_result(Ok(StatementResult {
        columns: vec![ColumnDesc::new("?column?", "int4")],
        rows: vec![vec![Value::Int(1)]],
        rows_updated: None,
        command_tag: None,
    }));
    let (mut client, handle, _shutdown) = spawn_gateway(backend);
    client.handshake().await;

    client.send_query("BEGIN").await;
    let messages = client.read_until_ready().await;
    assert_eq!(command_tag(&messages[0].1), "BEGIN");
    assert_eq!(messages.last().unwrap().1, b"T");

    client.send_query("SELECT 1").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages[0].0, b'T');
    assert_eq!(data_row_values(&messages[1].1), vec![Some("1".to_string())]);
    assert_eq!(command_tag(&messages[2].1), "SELECT 1");
    assert_eq!(messages.last().unwrap().1, b"T");

    client.send_query("COMMIT").await;
    let messages = client.read_until_ready().await;
    assert_eq!(command_tag(&messages[0].1), "COMMIT");
    assert_eq!(messages.last().unwrap().1, b"I");

    client.send_terminate().await;
    let (result, backend) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(
        backend.calls,
        vec![
            BackendCall::Begin,
            BackendCall::Execute("SELECT 1".to_string()),
            BackendCall::Commit,
        ]
    );
}

#[tokio::test]
async fn test_set_then_show_round_trip() {
    let (mut client, handle, _shutdown) = spawn_gateway(ScriptedBackend::new());
    client.handshake().await;

    client.send_query("SET timezone = 'UTC'").await;
    let messages = client.read_until_ready().await;
    assert_eq!(command_tag(&messages[0].1), "SET");

    client.send_query("SHOW timezone").await;
    let messages = client.read_until_ready().await;
    assert_eq!(row_description_names(&messages[0].1), vec!["timezone"]);
    assert_eq!(
        data_row_values(&messages[1].1),
        vec![Some("UTC".to_string())]
    );

    client.send_terminate().await;
    let (result, backend) = handle.await.unwrap();
    result.unwrap();
    assert!(backend.calls.is_empty());
}

#[tokio::test]
async fn test_extended_query_flow() {
    let (mut client, handle, _shutdown) = spawn_gateway(ScriptedBackend::new());
    client.handshake().await;

    let mut parse = Vec::new();
    parse.extend_from_slice(b"s\0SELECT 1\0");
    parse.extend_from_slice(&0i16.to_be_bytes());
    client.send_frame(b'P', &parse).await;

    let mut bind = Vec::new();
    bind.extend_from_slice(b"\0s\0");
    bind.extend_from_slice(&0i16.to_be_bytes());
    bind.extend_from_slice(&0i16.to_be_bytes());
    bind.extend_from_slice(&0i16.to_be_bytes());
    client.send_frame(b'B', &bind).await;

    client.send_frame(b'D', b"Ss\0").await;

    let mut execute = b"\0".to_vec();
    execute.extend_from_slice(&0i32.to_be_bytes());
    client.send_frame(b'E', &execute).await;

    client.send_frame(b'S', b"").await;

    assert_eq!(client.read_message().await.0, b'1');
    assert_eq!(client.read_message().await.0, b'2');
    let (tag, payload) = client.read_message().await;
    assert_eq!(tag, b'T');
    assert!(row_description_names(&payload).is_empty());
    assert_eq!(client.read_message().await.0, b'I');
    let (tag, payload) = client.read_message().await;
    assert_eq!(tag, b'Z');
    assert_eq!(payload, b"I");

    client.send_terminate().await;
    let (result, backend) = handle.await.unwrap();
    result.unwrap();
    assert!(backend.calls.is_empty());
}

#[tokio::test]
async fn test_terminate_rolls_back_open_transaction() {
    let (mut client, handle, _shutdown) = spawn_gateway(ScriptedBackend::new());
    client.handshake().await;

    client.send_query("BEGIN").await;
    client.read_until_ready().await;
    client.send_terminate().await;

    // The server closes the stream cleanly.
    let mut rest = Vec::new();
    client.stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let (result, backend) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(
        backend.calls,
        vec![BackendCall::Begin, BackendCall::Rollback]
    );
    assert!(!backend.is_in_transaction());
}

#[tokio::test]
async fn test_backend_error_leaves_connection_usable() {
    let mut backend = ScriptedBackend::new();
    backend.push_result(Err(BackendError::new(
        BackendErrorKind::BadRequest,
        "syntax error at or near \"FORM\"",
    )));
    let (mut client, handle, _shutdown) = spawn_gateway(backend);
    client.handshake().await;

    client.send_query("SELECT * FORM users").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages[0].0, b'E');
    let error_body = String::from_utf8_lossy(&messages[0].1).to_string();
    assert!(error_body.contains("42601"));
    assert!(error_body.contains("FORM"));
    assert_eq!(messages.last().unwrap().0, b'Z');

    // The connection is still usable.
    client.send_query("SELECT version()").await;
    let messages = client.read_until_ready().await;
    assert_eq!(command_tag(&messages[2].1), "SELECT 1");

    client.send_terminate().await;
    let (result, _) = handle.await.unwrap();
    result.unwrap();
}

#[tokio::test]
async fn test_empty_query() {
    let (mut client, handle, _shutdown) = spawn_gateway(ScriptedBackend::new());
    client.handshake().await;
    client.send_query("  ;  ").await;
    let messages = client.read_until_ready().await;
    assert_eq!(messages[0].0, b'I');
    assert_eq!(messages[1].0, b'Z');
    client.send_terminate().await;
    handle.await.unwrap().0.unwrap();
}

#[tokio::test]
async fn test_shutdown_signal_closes_connection_and_rolls_back() {
    let (mut client, handle, shutdown) = spawn_gateway(ScriptedBackend::new());
    client.handshake().await;
    client.send_query("BEGIN").await;
    client.read_until_ready().await;

    shutdown.send(true).unwrap();
    let (result, backend) = handle.await.unwrap();
    result.unwrap();
    assert_eq!(
        backend.calls,
        vec![BackendCall::Begin, BackendCall::Rollback]
    );
}

#[tokio::test]
async fn test_query_before_authentication_is_fatal() {
    let (mut client, handle, _shutdown) = spawn_gateway(ScriptedBackend::new());
    client.send_startup(&[("user", "alice")]).await;
    client.read_message().await; // AuthenticationCleartextPassword
    client.send_query("SELECT 1").await;
    let (result, _) = handle.await.unwrap();
    assert!(matches!(result, Err(GatewayError::Protocol(_))));
}
