//! # metastore-db
//!
//! Storage backends for metastore.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for record metadata, the legal tag index, and
//!   replay status
//! - A PostgreSQL-backed pull message bus
//! - In-memory equivalents of all of the above for single-node use and tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use metastore_db::{Backends, Database};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/metastore").await?;
//!     let backends = Backends::postgres(&db);
//!     let active = backends.records.count_active("opendes", None).await?;
//!     println!("{} active records", active);
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod memory;
pub mod pool;
pub mod records;
pub mod replay;
pub mod tag_index;

use std::sync::Arc;

pub use bus::{BusConfig, PgEventTransport};
pub use memory::{MemoryReplayRepository, MemoryStore, MemoryTransport};
pub use pool::{connect_pool, log_pool_metrics, PoolConfig};
pub use records::PgRecordStore;
pub use replay::PgReplayRepository;
pub use tag_index::PgTagAssociationIndex;

pub use metastore_core::*;

/// PostgreSQL repositories sharing one pool.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    bus_config: BusConfig,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            pool,
            bus_config: BusConfig::default(),
        }
    }

    /// Use `config` for transports built from this database.
    pub fn with_bus_config(mut self, config: BusConfig) -> Self {
        self.bus_config = config;
        self
    }

    /// Connect with default pool settings.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = connect_pool(url, &PoolConfig::default()).await?;
        Ok(Self::new(pool))
    }

    /// Connect with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = connect_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn records(&self) -> PgRecordStore {
        PgRecordStore::new(self.pool.clone())
    }

    pub fn tag_index(&self) -> PgTagAssociationIndex {
        PgTagAssociationIndex::new(self.pool.clone())
    }

    pub fn replays(&self) -> PgReplayRepository {
        PgReplayRepository::new(self.pool.clone())
    }

    pub fn transport(&self) -> PgEventTransport {
        PgEventTransport::with_config(self.pool.clone(), self.bus_config.clone())
    }
}

/// The capability set the pipeline runs against, behind trait objects.
#[derive(Clone)]
pub struct Backends {
    pub records: Arc<dyn RecordStore>,
    pub tag_index: Arc<dyn TagAssociationIndex>,
    pub replays: Arc<dyn ReplayRepository>,
    pub transport: Arc<dyn EventTransport>,
}

impl Backends {
    /// All capabilities backed by `db`.
    pub fn postgres(db: &Database) -> Self {
        Self {
            records: Arc::new(db.records()),
            tag_index: Arc::new(db.tag_index()),
            replays: Arc::new(db.replays()),
            transport: Arc::new(db.transport()),
        }
    }

    /// All capabilities in process memory.
    ///
    /// The record store and tag index share one [`MemoryStore`].
    pub fn memory(store: Arc<MemoryStore>, transport: MemoryTransport) -> Self {
        Self {
            records: store.clone(),
            tag_index: store,
            replays: Arc::new(MemoryReplayRepository::new()),
            transport: Arc::new(transport),
        }
    }
}
