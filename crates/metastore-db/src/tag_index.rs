//! Legal tag association index repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use metastore_core::{Error, Result, TagAssociationIndex};

/// PostgreSQL implementation of TagAssociationIndex.
pub struct PgTagAssociationIndex {
    pool: Pool<Postgres>,
}

impl PgTagAssociationIndex {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TagAssociationIndex for PgTagAssociationIndex {
    async fn record_tag(&self, partition_id: &str, tag: &str, record_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO legal_tag_association (data_partition_id, legal_tag_name, record_id)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(partition_id)
        .bind(tag)
        .bind(record_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn prune_tag(&self, partition_id: &str, tag: &str, record_ids: &[String]) -> Result<u64> {
        if record_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM legal_tag_association
             WHERE data_partition_id = $1 AND legal_tag_name = $2 AND record_id = ANY($3)",
        )
        .bind(partition_id)
        .bind(tag)
        .bind(record_ids)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn records_for_tag(&self, partition_id: &str, tag: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT record_id FROM legal_tag_association
             WHERE data_partition_id = $1 AND legal_tag_name = $2
             ORDER BY record_id",
        )
        .bind(partition_id)
        .bind(tag)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
