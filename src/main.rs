use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pggate::config::GatewayConfig;
use pggate::health::{self, HealthState};
use pggate::pgwire::server::{self, ServerStats};
use pggate::Result;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match GatewayConfig::try_parse() {
        Ok(config) => config,
        Err(e) => {
            // clap renders its own message, including --help output.
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gateway failed");
            ExitCode::from(1)
        }
    }
}

async fn run(config: GatewayConfig) -> Result<()> {
    config.validate()?;
    if config.access_key_id.is_some() {
        info!("using statically configured backend credentials");
    } else {
        info!("backend credentials resolved by the ambient chain");
    }

    let config = Arc::new(config);
    let stats = Arc::new(ServerStats::new());

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(addr = %listener.local_addr()?, database = %config.database, "gateway listening");

    if config.health_enabled {
        let health_listener = TcpListener::bind(config.health_addr()).await?;
        let state = HealthState {
            stats: stats.clone(),
            server_version: config.server_version.clone(),
            database: config.database.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = health::serve(health_listener, state, std::future::pending::<()>()).await {
                error!(error = %e, "health endpoint failed");
            }
        });
    }

    server::run(listener, config, stats, shutdown_signal()).await
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm => info!("received SIGTERM"),
    }
}
