//! Local SQLite storage shared by the cache, queue and conflict log.
//!
//! One connection sits behind a mutex. Callers run short closures against
//! it; [`Database::transaction`] commits when the closure returns `Ok` and
//! rolls back otherwise, so a failed write never leaves partial state.

use crate::{error::Result, schema::Schema, Error};
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const FIXED_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS sync_queue (
        id TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        payload TEXT,
        local_version INTEGER NOT NULL,
        remote_version INTEGER,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        generation INTEGER NOT NULL DEFAULT 0,
        UNIQUE(table_name, record_id)
    );
    CREATE INDEX IF NOT EXISTS idx_sync_queue_status
        ON sync_queue(status, priority DESC, created_at);

    CREATE TABLE IF NOT EXISTS conflicts (
        id TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        field TEXT,
        local_value TEXT NOT NULL,
        remote_value TEXT NOT NULL,
        base_value TEXT,
        local_timestamp INTEGER NOT NULL,
        remote_timestamp INTEGER NOT NULL,
        remote_version INTEGER,
        severity TEXT NOT NULL,
        auto_resolvable INTEGER NOT NULL,
        suggested_resolution TEXT,
        strategy_name TEXT,
        created_at INTEGER NOT NULL,
        resolved_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_conflicts_record
        ON conflicts(table_name, record_id);

    CREATE TABLE IF NOT EXISTS resolutions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        conflict_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        resolved_value TEXT NOT NULL,
        resolved_by TEXT NOT NULL,
        resolved_at INTEGER NOT NULL,
        strategy_name TEXT,
        notes TEXT
    );
    CREATE TRIGGER IF NOT EXISTS resolutions_append_only_update
        BEFORE UPDATE ON resolutions
        BEGIN SELECT RAISE(ABORT, 'resolutions are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS resolutions_append_only_delete
        BEFORE DELETE ON resolutions
        BEGIN SELECT RAISE(ABORT, 'resolutions are append-only'); END;

    CREATE TABLE IF NOT EXISTS watermarks (
        table_name TEXT PRIMARY KEY,
        watermark INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS pull_failures (
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        last_error TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (table_name, record_id)
    );
";

/// Name of the SQLite table backing a cached schema table.
pub(crate) fn cache_table(name: &str) -> String {
    format!("cache_{name}")
}

/// The local database.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) a database file and prepares it for `schema`.
    pub fn open(path: impl AsRef<Path>, schema: &Schema) -> Result<Self> {
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn, schema)
    }

    /// Opens an in-memory database (for testing).
    pub fn open_in_memory(schema: &Schema) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, schema)
    }

    fn init(conn: Connection, schema: &Schema) -> Result<Self> {
        schema.check()?;
        conn.execute_batch(FIXED_TABLES)?;
        for table in schema.tables.keys() {
            let name = cache_table(table);
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    cached_at INTEGER NOT NULL,
                    ttl_expires_at INTEGER,
                    version INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    base_payload TEXT,
                    remote_version INTEGER,
                    remote_updated_at INTEGER,
                    size_bytes INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{name}_cached_at ON {name}(cached_at);
                CREATE INDEX IF NOT EXISTS idx_{name}_ttl ON {name}(ttl_expires_at);"
            ))?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Runs `f` inside a transaction, committing only if it succeeds.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Runs a read-only closure against the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, TableSchema};

    fn schema() -> Schema {
        Schema::new(1).with_table(TableSchema::new(
            "notes",
            vec![FieldDef::required("body", FieldType::String)],
        ))
    }

    fn count(db: &Database, sql: &str) -> i64 {
        db.read(|c| Ok(c.query_row(sql, [], |r| r.get(0))?)).unwrap()
    }

    #[test]
    fn creates_fixed_and_cache_tables() {
        let db = Database::open_in_memory(&schema()).unwrap();
        let tables = count(
            &db,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
             ('sync_queue', 'conflicts', 'resolutions', 'watermarks', 'pull_failures',
              'cache_notes')",
        );
        assert_eq!(tables, 6);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let db = Database::open_in_memory(&schema()).unwrap();
        let result: Result<()> = db.transaction(|tx| {
            tx.execute("INSERT INTO watermarks (table_name, watermark) VALUES ('notes', 5)", [])?;
            Err(Error::Remote("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(count(&db, "SELECT COUNT(*) FROM watermarks"), 0);
    }

    #[test]
    fn resolutions_are_append_only() {
        let db = Database::open_in_memory(&schema()).unwrap();
        db.transaction(|tx| {
            tx.execute(
                "INSERT INTO resolutions (conflict_id, kind, resolved_value, resolved_by, resolved_at)
                 VALUES ('c1', 'local', '1', 'auto', 10)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let update = db.transaction(|tx| {
            tx.execute("UPDATE resolutions SET kind = 'remote'", [])?;
            Ok(())
        });
        assert!(update.is_err());
        let delete = db.transaction(|tx| {
            tx.execute("DELETE FROM resolutions", [])?;
            Ok(())
        });
        assert!(delete.is_err());
        assert_eq!(count(&db, "SELECT COUNT(*) FROM resolutions"), 1);
    }

    #[test]
    fn invalid_schema_is_rejected() {
        let bad = Schema::new(1).with_table(TableSchema::new("drop table", vec![]));
        assert!(matches!(
            Database::open_in_memory(&bad),
            Err(Error::InvalidSchema(_))
        ));
    }

    #[test]
    fn reopening_a_file_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let db = Database::open(&path, &schema()).unwrap();
            db.transaction(|tx| {
                tx.execute("INSERT INTO watermarks (table_name, watermark) VALUES ('notes', 7)", [])?;
                Ok(())
            })
            .unwrap();
        }
        let db = Database::open(&path, &schema()).unwrap();
        assert_eq!(count(&db, "SELECT watermark FROM watermarks"), 7);
    }
}
