//! Postgres connection pool for the record store, tag index, replay status and bus.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use metastore_core::{Error, Result};

/// Pool sizing for one service process.
///
/// Every subscription pump holds a connection while it claims and settles, and
/// each in-flight replay page needs one more for its publish.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// How long a caller waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Read `DATABASE_MAX_CONNECTIONS` and `DATABASE_CONNECT_TIMEOUT_SECS`.
    ///
    /// Unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var("DATABASE_MAX_CONNECTIONS").ok().as_deref(),
            std::env::var("DATABASE_CONNECT_TIMEOUT_SECS").ok().as_deref(),
        )
    }

    fn from_values(max_connections: Option<&str>, acquire_timeout_secs: Option<&str>) -> Self {
        let mut config = Self::default();
        if let Some(n) = max_connections.and_then(|v| v.parse().ok()) {
            config.max_connections = n;
        }
        if let Some(secs) = acquire_timeout_secs.and_then(|v| v.parse().ok()) {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        config
    }
}

/// Open a pool against `database_url`.
pub async fn connect_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

/// Log current pool health. Warns when no idle connection is left.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle();

    debug!(
        subsystem = "db",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool health check"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = size,
            "Connection pool has no idle connections, replay pages may stall"
        );
    }
}
