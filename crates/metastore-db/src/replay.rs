//! Replay status repository implementation.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use metastore_core::{Error, ReplayMetaData, ReplayRepository, Result};

/// PostgreSQL implementation of ReplayRepository.
///
/// Rows in a terminal state are never overwritten.
pub struct PgReplayRepository {
    pool: Pool<Postgres>,
}

impl PgReplayRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_replay_row(row: PgRow) -> Result<ReplayMetaData> {
        let operation: String = row.get("operation");
        let state: String = row.get("state");
        Ok(ReplayMetaData {
            replay_id: row.get("replay_id"),
            kind: row.get("kind"),
            operation: operation.parse()?,
            total_records: row.get("total_records"),
            processed_records: row.get("processed_records"),
            started_at: row.get("started_at"),
            elapsed_time: row.get("elapsed_time"),
            state: state.parse()?,
        })
    }
}

#[async_trait]
impl ReplayRepository for PgReplayRepository {
    async fn save(&self, partition_id: &str, meta: &ReplayMetaData) -> Result<()> {
        sqlx::query(
            "INSERT INTO replay_status
                (data_partition_id, replay_id, kind, operation, total_records,
                 processed_records, started_at, elapsed_time, state, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
             ON CONFLICT (data_partition_id, replay_id) DO UPDATE SET
                total_records = EXCLUDED.total_records,
                processed_records = EXCLUDED.processed_records,
                elapsed_time = EXCLUDED.elapsed_time,
                state = EXCLUDED.state,
                updated_at = NOW()
             WHERE replay_status.state NOT IN ('COMPLETED', 'FAILED', 'STOPPED')",
        )
        .bind(partition_id)
        .bind(meta.replay_id)
        .bind(&meta.kind)
        .bind(meta.operation.as_str())
        .bind(meta.total_records)
        .bind(meta.processed_records)
        .bind(meta.started_at)
        .bind(&meta.elapsed_time)
        .bind(meta.state.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, partition_id: &str, replay_id: Uuid) -> Result<Option<ReplayMetaData>> {
        let row = sqlx::query(
            "SELECT replay_id, kind, operation, total_records, processed_records,
                    started_at, elapsed_time, state
             FROM replay_status
             WHERE data_partition_id = $1 AND replay_id = $2",
        )
        .bind(partition_id)
        .bind(replay_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_replay_row).transpose()
    }

    async fn list_unfinished(&self, partition_id: &str) -> Result<Vec<ReplayMetaData>> {
        let rows = sqlx::query(
            "SELECT replay_id, kind, operation, total_records, processed_records,
                    started_at, elapsed_time, state
             FROM replay_status
             WHERE data_partition_id = $1 AND state IN ('QUEUED', 'IN_PROGRESS')
             ORDER BY started_at",
        )
        .bind(partition_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_replay_row).collect()
    }
}
