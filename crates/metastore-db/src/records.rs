//! Record metadata repository implementation.

use std::collections::BTreeSet;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};

use metastore_core::{
    Cursor, Error, Legal, Page, RecordIdAndKind, RecordMetadata, RecordStore, Result,
};

/// Encode a keyset position (the last id of a page) as a cursor.
pub(crate) fn encode_cursor(last_id: &str) -> Cursor {
    Cursor::new(URL_SAFE_NO_PAD.encode(last_id.as_bytes()))
}

/// Decode a cursor back into the keyset position it was built from.
pub(crate) fn decode_cursor(cursor: Option<&Cursor>) -> Result<Option<String>> {
    let Some(cursor) = cursor else {
        return Ok(None);
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.as_str())
        .map_err(|e| Error::InvalidInput(format!("Malformed cursor: {}", e)))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("Malformed cursor: {}", e)))
}

/// Split a `limit + 1` fetch into a page and its continuation cursor.
pub(crate) fn paginate<T>(mut items: Vec<T>, limit: usize, id_of: impl Fn(&T) -> &str) -> Page<T> {
    if items.len() <= limit {
        return Page::last(items);
    }
    items.truncate(limit);
    let cursor = items.last().map(|item| encode_cursor(id_of(item)));
    Page { items, cursor }
}

/// PostgreSQL implementation of RecordStore.
pub struct PgRecordStore {
    pool: Pool<Postgres>,
}

impl PgRecordStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: PgRow) -> Result<RecordMetadata> {
        let tags: Vec<String> = row.get("legal_tags");
        let legal_status: String = row.get("legal_status");
        let status: String = row.get("status");
        Ok(RecordMetadata {
            id: row.get("id"),
            kind: row.get("kind"),
            legal: Legal {
                legaltags: tags.into_iter().collect::<BTreeSet<_>>(),
                status: legal_status.parse()?,
            },
            status: status.parse()?,
            version: row.get("version"),
        })
    }

    /// Row of the tag index joined to its record; `kind` is NULL when the record is gone.
    fn parse_indexed_row(row: PgRow) -> Result<RecordMetadata> {
        let kind: Option<String> = row.get("kind");
        if kind.is_none() {
            return Ok(RecordMetadata::missing(row.get::<String, _>("id")));
        }
        Self::parse_record_row(row)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn query_by_legal_tag_name(
        &self,
        partition_id: &str,
        tag: &str,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordMetadata>> {
        let after = decode_cursor(cursor)?;
        let rows = sqlx::query(
            "SELECT a.record_id AS id, r.kind, r.legal_tags, r.legal_status, r.status, r.version
             FROM legal_tag_association a
             LEFT JOIN record_metadata r
               ON r.data_partition_id = a.data_partition_id AND r.id = a.record_id
             WHERE a.data_partition_id = $1
               AND a.legal_tag_name = $2
               AND ($3::text IS NULL OR a.record_id > $3)
             ORDER BY a.record_id
             LIMIT $4",
        )
        .bind(partition_id)
        .bind(tag)
        .bind(after)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let records = rows
            .into_iter()
            .map(Self::parse_indexed_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(paginate(records, limit, |r| r.id.as_str()))
    }

    async fn batch_upsert(&self, partition_id: &str, records: &[RecordMetadata]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        for record in records {
            let tags: Vec<String> = record.legal.legaltags.iter().cloned().collect();
            sqlx::query(
                "INSERT INTO record_metadata
                    (data_partition_id, id, kind, legal_tags, legal_status, status, version, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                 ON CONFLICT (data_partition_id, id) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    legal_tags = EXCLUDED.legal_tags,
                    legal_status = EXCLUDED.legal_status,
                    status = EXCLUDED.status,
                    version = EXCLUDED.version,
                    updated_at = NOW()",
            )
            .bind(partition_id)
            .bind(&record.id)
            .bind(&record.kind)
            .bind(&tags)
            .bind(record.legal.status.as_str())
            .bind(record.status.as_str())
            .bind(record.version)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn delete(&self, partition_id: &str, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        sqlx::query("DELETE FROM legal_tag_association WHERE data_partition_id = $1 AND record_id = $2")
            .bind(partition_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query("DELETE FROM record_metadata WHERE data_partition_id = $1 AND id = $2")
            .bind(partition_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, partition_id: &str, id: &str) -> Result<Option<RecordMetadata>> {
        let row = sqlx::query(
            "SELECT id, kind, legal_tags, legal_status, status, version
             FROM record_metadata
             WHERE data_partition_id = $1 AND id = $2",
        )
        .bind(partition_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_record_row).transpose()
    }

    async fn count_active(&self, partition_id: &str, kind: Option<&str>) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM record_metadata
             WHERE data_partition_id = $1
               AND status = 'active'
               AND ($2::text IS NULL OR kind = $2)",
        )
        .bind(partition_id)
        .bind(kind)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count.0)
    }

    async fn query_ids_and_kinds(
        &self,
        partition_id: &str,
        kind: Option<&str>,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordIdAndKind>> {
        let after = decode_cursor(cursor)?;
        let rows = sqlx::query(
            "SELECT id, kind FROM record_metadata
             WHERE data_partition_id = $1
               AND status = 'active'
               AND ($2::text IS NULL OR kind = $2)
               AND ($3::text IS NULL OR id > $3)
             ORDER BY id
             LIMIT $4",
        )
        .bind(partition_id)
        .bind(kind)
        .bind(after)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let items = rows
            .into_iter()
            .map(|row| RecordIdAndKind {
                id: row.get("id"),
                kind: row.get("kind"),
            })
            .collect();
        Ok(paginate(items, limit, |r: &RecordIdAndKind| r.id.as_str()))
    }
}
