//! Environment-driven gateway configuration.

use clap::Parser;

use crate::dataapi::DataApiConfig;
use crate::error::{GatewayError, Result};
use crate::pgwire::protocol::ProtocolSettings;

/// Gateway configuration, resolved from flags and environment variables
/// at startup. The cluster identifier, credentials-secret identifier and
/// database name are required; everything else has a working default.
#[derive(Parser, Debug, Clone)]
#[clap(name = "pggate", about = "PostgreSQL wire-protocol gateway for an HTTP SQL backend")]
pub struct GatewayConfig {
    /// Identifier of the database cluster the backend executes against.
    #[clap(long, env = "PGGATE_CLUSTER_ARN")]
    pub cluster_arn: String,

    /// Identifier of the credentials secret the backend resolves.
    #[clap(long, env = "PGGATE_SECRET_ARN")]
    pub secret_arn: String,

    /// Database name presented to clients and sent with every backend call.
    #[clap(long, env = "PGGATE_DATABASE")]
    pub database: String,

    #[clap(long, env = "PGGATE_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Backend endpoint URL; defaults to the regional SQL endpoint.
    #[clap(long, env = "PGGATE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Static credentials for the backend's ambient credential chain.
    /// When absent, resolution falls back to container or instance
    /// metadata and then the default chain of the deployment.
    #[clap(long, env = "PGGATE_ACCESS_KEY_ID")]
    pub access_key_id: Option<String>,

    #[clap(long, env = "PGGATE_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: Option<String>,

    #[clap(long, env = "PGGATE_LISTEN_HOST", default_value = "127.0.0.1")]
    pub listen_host: String,

    #[clap(long, env = "PGGATE_LISTEN_PORT", default_value_t = 5432)]
    pub listen_port: u16,

    /// Serve GET /health and GET /metrics on the health port.
    #[clap(long, env = "PGGATE_HEALTH_ENABLED", default_value_t = false)]
    pub health_enabled: bool,

    #[clap(long, env = "PGGATE_HEALTH_PORT", default_value_t = 8090)]
    pub health_port: u16,

    #[clap(long, env = "PGGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Version advertised in parameter status and SHOW server_version.
    #[clap(long, env = "PGGATE_SERVER_VERSION", default_value = "14.9")]
    pub server_version: String,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("cluster identifier", &self.cluster_arn),
            ("secret identifier", &self.secret_arn),
            ("database name", &self.database),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::Config(format!("{name} must not be empty")));
            }
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(GatewayError::Config(
                "access key and secret key must be provided together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.health_port)
    }

    pub fn backend_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://rds-data.{}.amazonaws.com", self.region))
    }

    pub fn dataapi_config(&self) -> DataApiConfig {
        DataApiConfig {
            endpoint: self.backend_endpoint(),
            resource_arn: self.cluster_arn.clone(),
            secret_arn: self.secret_arn.clone(),
            database: self.database.clone(),
        }
    }

    pub fn protocol_settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            database: self.database.clone(),
            server_version: self.server_version.clone(),
            version_banner: format!(
                "PostgreSQL {} on x86_64-pc-linux-gnu (pggate), 64-bit",
                self.server_version
            ),
        }
    }
}
