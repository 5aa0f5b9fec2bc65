//! The connection manager: owns the listener, accepts sockets, tracks
//! connection lifetimes and statistics, and broadcasts shutdown.

use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::dataapi::DataApiClient;
use crate::error::Result;
use crate::pgwire::codec::FramedConn;
use crate::pgwire::message::ErrorResponse;
use crate::pgwire::protocol;

/// Hard cap on concurrent client connections.
const MAX_CONNECTIONS: u64 = 100;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide counters shared with the health surface. Updated only by
/// the manager on connect/close/error events.
#[derive(Debug)]
pub struct ServerStats {
    start: Instant,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    errors: AtomicU64,
    accepting: AtomicBool,
}

impl ServerStats {
    pub fn new() -> ServerStats {
        ServerStats {
            start: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    fn connect(&self) {
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnect(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.total_connections.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        ServerStats::new()
    }
}

/// Runs the accept loop until `shutdown` resolves or the listener fails
/// fatally. On shutdown every active connection is force-closed, which
/// triggers backend cleanup inside each state machine.
pub async fn run(
    listener: TcpListener,
    config: Arc<GatewayConfig>,
    stats: Arc<ServerStats>,
    shutdown: impl Future,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = Listener {
        listener,
        config,
        stats: stats.clone(),
        shutdown_rx,
    };

    tokio::select! {
        res = server.run() => {
            stats.stop_accepting();
            if let Err(err) = res {
                error!(error = %err, "fatal listener error");
                return Err(err);
            }
        }
        _ = shutdown => {
            info!("shutting down");
            stats.stop_accepting();
            let _ = shutdown_tx.send(true);
            drain(&stats).await;
        }
    }

    info!("exit");
    Ok(())
}

/// Waits briefly for force-closed connections to finish their backend
/// cleanup before the process exits.
async fn drain(stats: &ServerStats) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while stats.active() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if stats.active() > 0 {
        warn!(active = stats.active(), "connections still open at exit");
    }
}

struct Listener {
    listener: TcpListener,
    config: Arc<GatewayConfig>,
    stats: Arc<ServerStats>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Listener {
    async fn run(&mut self) -> Result<()> {
        info!("accepting inbound connections");
        let conn_id = Arc::new(AtomicU32::new(1));

        loop {
            let (conn, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_fatal_listener_error(&e) => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    self.stats.record_error();
                    continue;
                }
            };

            if self.stats.active() >= MAX_CONNECTIONS {
                warn!(peer = %addr, "connection limit reached, refusing");
                drop(conn);
                continue;
            }

            if let Err(e) = tune_socket(&conn) {
                warn!(peer = %addr, error = %e, "socket tuning failed");
            }

            self.stats.connect();
            let conn_id = conn_id.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                let conn_id = conn_id.fetch_add(1, Ordering::SeqCst);
                info!(conn_id, peer = %addr, "connection opened");
                let outcome = AssertUnwindSafe(handle(conn_id, conn, config, shutdown_rx))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(conn_id, peer = %addr, error = %e, "connection failed");
                        stats.record_error();
                    }
                    Err(_) => {
                        error!(conn_id, peer = %addr, "connection task panicked");
                        stats.record_error();
                    }
                }
                stats.disconnect();
                info!(conn_id, peer = %addr, "connection closed");
            });
        }
    }
}

/// Listener errors that cannot be recovered by accepting again.
fn is_fatal_listener_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}

fn tune_socket(conn: &TcpStream) -> io::Result<()> {
    conn.set_nodelay(true)?;
    let sock = SockRef::from(conn);
    sock.set_tcp_keepalive(
        &TcpKeepalive::new()
            .with_time(KEEPALIVE_INTERVAL)
            .with_interval(KEEPALIVE_INTERVAL),
    )
}

/// Per-connection handler: builds the framed connection and its backend
/// client, then hands both to the state machine. The connection
/// exclusively owns its session state and backend client; nothing here
/// outlives the socket.
async fn handle(
    conn_id: u32,
    conn: TcpStream,
    config: Arc<GatewayConfig>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut framed = FramedConn::new(conn_id, conn);
    let mut backend = DataApiClient::new(config.dataapi_config())?;
    let result = protocol::run(
        &mut framed,
        &mut backend,
        config.protocol_settings(),
        shutdown_rx,
    )
    .await;
    if let Err(e) = &result {
        // Best effort: tell the client why before the socket drops.
        let response = ErrorResponse::from(e);
        let _ = framed
            .send(crate::pgwire::message::BackendMessage::ErrorResponse(response))
            .await;
        let _ = framed.flush().await;
    }
    result
}
