//! PostgreSQL implementation of the engine's remote store.

use crate::db::{self, Pool, WriteOutcome};
use async_trait::async_trait;
use hoard_engine::{RemoteError, RemoteRecord, RemoteStore, RemoteWrite, Timestamp};
use tracing::debug;

/// Remote store backed by the `records` table.
#[derive(Debug, Clone)]
pub struct PgRemoteStore {
    pool: Pool,
}

impl PgRemoteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Connection trouble is worth retrying; anything the database itself
/// refuses is not.
fn map_err(err: sqlx::Error) -> RemoteError {
    match err {
        sqlx::Error::Database(db_err) => RemoteError::Rejected(db_err.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            RemoteError::Rejected(err.to_string())
        }
        other => RemoteError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl RemoteStore for PgRemoteStore {
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<RemoteRecord>, RemoteError> {
        let stored = db::get_record(&self.pool, table, id).await.map_err(map_err)?;
        Ok(stored.map(|r| r.to_remote()))
    }

    async fn fetch_changed_since(
        &self,
        table: &str,
        watermark: Timestamp,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let since = i64::try_from(watermark).unwrap_or(i64::MAX);
        let rows = db::get_records_since(&self.pool, table, since)
            .await
            .map_err(map_err)?;
        debug!(table, since, changed = rows.len(), "fetched remote changes");
        Ok(rows.iter().map(|r| r.to_remote()).collect())
    }

    async fn upsert(&self, table: &str, write: RemoteWrite) -> Result<RemoteRecord, RemoteError> {
        match db::upsert_record(&self.pool, table, &write)
            .await
            .map_err(map_err)?
        {
            WriteOutcome::Written(stored) => Ok(stored.to_remote()),
            WriteOutcome::Stale { actual } => Err(RemoteError::Precondition {
                expected: write.expected_version,
                actual: actual.map(|v| v as u64),
            }),
        }
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let removed = db::tombstone_record(&self.pool, table, id)
            .await
            .map_err(map_err)?;
        if !removed {
            debug!(table, id, "delete of absent record");
        }
        Ok(())
    }
}
