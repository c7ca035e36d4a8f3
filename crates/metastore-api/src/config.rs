//! Service configuration.

use std::str::FromStr;

use metastore_core::{defaults, Error, Result};

/// Which backend set the service runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(Error::Config(format!(
                "STORE_BACKEND must be postgres or memory, got {:?}",
                other
            ))),
        }
    }
}

/// Top-level settings of the service process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_backend: StoreBackend,
    pub database_url: String,
    /// Tenants served by this process.
    pub tenants: Vec<String>,
    /// Create the tenant topics at startup.
    pub provision_topics: bool,
    pub notification_batch_size: usize,
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `STORE_BACKEND` | `postgres` | `postgres` or `memory` |
    /// | `DATABASE_URL` | `postgres://localhost/metastore` | Postgres connection string |
    /// | `TENANTS` | (required) | Comma-separated data partition ids |
    /// | `PROVISION_TOPICS` | `true` for memory, else `false` | Create tenant topics at startup |
    /// | `NOTIFICATION_BATCH_SIZE` | `50` | Records per change notification message |
    /// | `HOST` | `0.0.0.0` | Bind address |
    /// | `PORT` | `8080` | Bind port |
    pub fn from_env() -> Result<Self> {
        let store_backend = std::env::var("STORE_BACKEND")
            .map(|v| v.parse())
            .unwrap_or(Ok(StoreBackend::Postgres))?;

        let tenants = parse_tenants(&std::env::var("TENANTS").unwrap_or_default());
        if tenants.is_empty() {
            return Err(Error::Config("TENANTS must name at least one tenant".into()));
        }

        let provision_topics = std::env::var("PROVISION_TOPICS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(store_backend == StoreBackend::Memory);

        let notification_batch_size = std::env::var("NOTIFICATION_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::NOTIFICATION_BATCH_SIZE)
            .max(1);

        let port = match std::env::var("PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| Error::Config(format!("PORT is not a valid port: {:?}", v)))?,
            Err(_) => defaults::SERVER_PORT,
        };

        Ok(Self {
            store_backend,
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/metastore".to_string()),
            tenants,
            provision_topics,
            notification_batch_size,
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
        })
    }
}

/// Split a comma-separated tenant list, dropping blanks and duplicates.
pub fn parse_tenants(raw: &str) -> Vec<String> {
    let mut tenants: Vec<String> = Vec::new();
    for tenant in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !tenants.iter().any(|t| t == tenant) {
            tenants.push(tenant.to_string());
        }
    }
    tenants
}
