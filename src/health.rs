//! Optional HTTP admin surface: a JSON health check and a minimal
//! Prometheus exposition.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use crate::error::Result;
use crate::pgwire::server::ServerStats;

#[derive(Clone)]
pub struct HealthState {
    pub stats: Arc<ServerStats>,
    pub server_version: String,
    pub database: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves the admin surface until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: HealthState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "health endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health(State(state): State<HealthState>) -> Response {
    let healthy = state.stats.is_accepting();
    let body = Json(json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "server": {
            "version": state.server_version,
            "database": state.database,
            "uptime_seconds": state.stats.uptime_seconds(),
        },
        "connections": {
            "total": state.stats.total(),
            "active": state.stats.active(),
            "errors": state.stats.errors(),
        },
        "health": {
            "listener": if healthy { "ok" } else { "stopped" },
        },
    }));
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, body).into_response()
}

async fn metrics(State(state): State<HealthState>) -> Response {
    let body = format!(
        "# HELP pggate_connections_total Connections accepted since start.\n\
         # TYPE pggate_connections_total counter\n\
         pggate_connections_total {}\n\
         # HELP pggate_connections_active Currently open connections.\n\
         # TYPE pggate_connections_active gauge\n\
         pggate_connections_active {}\n\
         # HELP pggate_errors_total Connection errors since start.\n\
         # TYPE pggate_errors_total counter\n\
         pggate_errors_total {}\n\
         # HELP pggate_uptime_seconds Seconds since the gateway started.\n\
         # TYPE pggate_uptime_seconds gauge\n\
         pggate_uptime_seconds {}\n",
        state.stats.total(),
        state.stats.active(),
        state.stats.errors(),
        state.stats.uptime_seconds(),
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
