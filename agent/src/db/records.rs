//! Database operations for the records table.

use hoard_engine::{RemoteRecord, RemoteWrite, Timestamp, Version};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub table_name: String,
    pub record_id: String,
    pub payload: serde_json::Value,
    pub version: i64,
    pub deleted: bool,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            payload: row.try_get("payload")?,
            version: row.try_get("version")?,
            deleted: row.try_get("deleted")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredRecord {
    /// Convert database row to the engine's remote record.
    pub fn to_remote(&self) -> RemoteRecord {
        RemoteRecord {
            table: self.table_name.clone(),
            id: self.record_id.clone(),
            payload: if self.deleted {
                serde_json::Value::Null
            } else {
                self.payload.clone()
            },
            version: self.version as Version,
            updated_at: self.updated_at as Timestamp,
            deleted: self.deleted,
        }
    }
}

/// Outcome of a guarded write.
#[derive(Debug)]
pub enum WriteOutcome {
    Written(StoredRecord),
    /// The row held another version than the caller expected
    Stale { actual: Option<i64> },
}

/// Get a record by table and ID, tombstones included.
pub async fn get_record(
    pool: &PgPool,
    table_name: &str,
    record_id: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(
        r#"
        SELECT table_name, record_id, payload, version, deleted, updated_at
        FROM records
        WHERE table_name = $1 AND record_id = $2
        "#,
    )
    .bind(table_name)
    .bind(record_id)
    .fetch_optional(pool)
    .await
}

/// Get records of a table changed strictly after `since`, oldest first.
pub async fn get_records_since(
    pool: &PgPool,
    table_name: &str,
    since: i64,
) -> Result<Vec<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(
        r#"
        SELECT table_name, record_id, payload, version, deleted, updated_at
        FROM records
        WHERE table_name = $1 AND updated_at > $2
        ORDER BY updated_at ASC, record_id ASC
        "#,
    )
    .bind(table_name)
    .bind(since)
    .fetch_all(pool)
    .await
}

/// Lock the row for `(table_name, record_id)` and return its version.
async fn lock_version(
    tx: &mut Transaction<'_, Postgres>,
    table_name: &str,
    record_id: &str,
) -> Result<Option<(i64, bool)>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT version, deleted FROM records WHERE table_name = $1 AND record_id = $2 FOR UPDATE",
    )
    .bind(table_name)
    .bind(record_id)
    .fetch_optional(&mut **tx)
    .await?;
    match row {
        Some(r) => Ok(Some((r.try_get("version")?, r.try_get("deleted")?))),
        None => Ok(None),
    }
}

/// Next change-feed timestamp for a table: wall clock, but always past the
/// newest row so the feed stays strictly ordered.
async fn next_updated_at(
    tx: &mut Transaction<'_, Postgres>,
    table_name: &str,
) -> Result<i64, sqlx::Error> {
    let newest: Option<i64> =
        sqlx::query_scalar("SELECT MAX(updated_at) FROM records WHERE table_name = $1")
            .bind(table_name)
            .fetch_one(&mut **tx)
            .await?;
    let now = chrono::Utc::now().timestamp_millis();
    Ok(newest.map_or(now, |n| now.max(n + 1)))
}

/// Create a record that must not exist yet. A concurrent create of the
/// same id makes this a no-op instead of a key violation.
const CREATE_SQL: &str = r#"
    INSERT INTO records (table_name, record_id, payload, version, deleted, updated_at)
    VALUES ($1, $2, $3, 1, FALSE, $4)
    ON CONFLICT (table_name, record_id) DO NOTHING
    RETURNING table_name, record_id, payload, version, deleted, updated_at
"#;

/// Replace a record only while it still holds version `$5`.
const REPLACE_SQL: &str = r#"
    UPDATE records
    SET payload = $3, version = version + 1, deleted = FALSE,
        updated_at = $4, written_at = NOW()
    WHERE table_name = $1 AND record_id = $2 AND version = $5
    RETURNING table_name, record_id, payload, version, deleted, updated_at
"#;

/// Statement for a write guarded by `expected`.
fn write_sql(expected: Option<Version>) -> &'static str {
    match expected {
        None => CREATE_SQL,
        Some(_) => REPLACE_SQL,
    }
}

/// Write a record if it still holds `write.expected_version`. The guard is
/// part of the statement, so a concurrent writer turns this into `Stale`.
pub async fn upsert_record(
    pool: &PgPool,
    table_name: &str,
    write: &RemoteWrite,
) -> Result<WriteOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let updated_at = next_updated_at(&mut tx, table_name).await?;
    let mut query = sqlx::query_as::<_, StoredRecord>(write_sql(write.expected_version))
        .bind(table_name)
        .bind(&write.id)
        .bind(&write.payload)
        .bind(updated_at);
    if let Some(expected) = write.expected_version {
        query = query.bind(expected as i64);
    }
    let stored = query.fetch_optional(&mut *tx).await?;

    match stored {
        Some(stored) => {
            tx.commit().await?;
            Ok(WriteOutcome::Written(stored))
        }
        None => {
            let actual = lock_version(&mut tx, table_name, &write.id).await?.map(|(v, _)| v);
            tx.rollback().await?;
            Ok(WriteOutcome::Stale { actual })
        }
    }
}

/// Turn a live record into a tombstone. Returns `false` if there was
/// nothing to delete.
pub async fn tombstone_record(
    pool: &PgPool,
    table_name: &str,
    record_id: &str,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    match lock_version(&mut tx, table_name, record_id).await? {
        Some((_, false)) => {}
        _ => {
            tx.rollback().await?;
            return Ok(false);
        }
    }

    let updated_at = next_updated_at(&mut tx, table_name).await?;
    sqlx::query(
        r#"
        UPDATE records
        SET payload = 'null'::jsonb, version = version + 1, deleted = TRUE,
            updated_at = $3, written_at = NOW()
        WHERE table_name = $1 AND record_id = $2
        "#,
    )
    .bind(table_name)
    .bind(record_id)
    .bind(updated_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_never_overwrites() {
        let sql = write_sql(None);
        assert!(sql.contains("ON CONFLICT (table_name, record_id) DO NOTHING"));
        assert!(!sql.contains("DO UPDATE"));
    }

    #[test]
    fn replace_is_guarded_by_version() {
        let sql = write_sql(Some(3));
        assert!(sql.starts_with("\n    UPDATE records"));
        assert!(sql.contains("AND version = $5"));
    }

    /// Runs against `DATABASE_URL` when one is set.
    #[tokio::test]
    async fn concurrent_creates_leave_one_winner() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let pool = crate::db::create_pool(&url).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let id = format!("race-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let write = |body: &str| RemoteWrite {
            id: id.clone(),
            payload: serde_json::json!({ "title": body }),
            expected_version: None,
        };

        let (write_a, write_b) = (write("a"), write("b"));
        let (a, b) = tokio::join!(
            upsert_record(&pool, "race_tests", &write_a),
            upsert_record(&pool, "race_tests", &write_b),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let written = outcomes
            .iter()
            .filter(|o| matches!(o, WriteOutcome::Written(_)))
            .count();
        assert_eq!(written, 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, WriteOutcome::Stale { actual: Some(1) })));

        let stale = upsert_record(
            &pool,
            "race_tests",
            &RemoteWrite {
                expected_version: Some(7),
                ..write("c")
            },
        )
        .await
        .unwrap();
        assert!(matches!(stale, WriteOutcome::Stale { actual: Some(1) }));
    }
}
