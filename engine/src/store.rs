//! Cache Store - versioned, TTL- and size-bounded local persistence.
//!
//! Every cached table is a `cache_<table>` SQLite table. Writes validate the
//! payload against the table schema, bump the record version and append a
//! queue entry in one transaction. Budgets are enforced inside the same
//! transaction when a write crosses them, and in bounded batches by
//! [`CacheStore::sweep`].

use crate::{
    clock::Clock,
    config::SyncConfig,
    db::{cache_table, Database},
    error::Result,
    operation::Operation,
    queue::{self, NewEntry},
    record::{CacheRecord, RemoteRecord},
    schema::{FieldType, Schema, TableSchema},
    Error, Timestamp, Version,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Options for [`CacheStore::put`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Write locally without queueing an upload
    pub skip_sync: bool,
}

impl PutOptions {
    pub fn skip_sync() -> Self {
        Self { skip_sync: true }
    }
}

/// What [`CacheStore::apply_remote`] did with a pulled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Stored as the new local state at this local version
    Applied(Version),
    /// Already applied; nothing changed
    Unchanged,
    /// Tombstone; the local row was removed
    Removed,
}

/// Rows removed by a limit enforcement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    pub expired: usize,
    pub evicted: usize,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.expired + self.evicted
    }
}

/// Cache counters and current footprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub records: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

const RECORD_COLUMNS: &str = "id, payload, cached_at, ttl_expires_at, version, updated_at,
    base_payload, remote_version, remote_updated_at";

fn read_record(table: &str, row: &Row<'_>) -> rusqlite::Result<CacheRecord> {
    Ok(CacheRecord {
        table: table.to_string(),
        id: row.get(0)?,
        payload: row.get(1)?,
        cached_at: row.get(2)?,
        ttl_expires_at: row.get(3)?,
        version: row.get(4)?,
        updated_at: row.get(5)?,
        base_payload: row.get(6)?,
        remote_version: row.get(7)?,
        remote_updated_at: row.get(8)?,
    })
}

/// Load a record regardless of expiry.
pub(crate) fn record_in(conn: &Connection, table: &str, id: &str) -> Result<Option<CacheRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?1",
        cache_table(table)
    );
    Ok(conn
        .query_row(&sql, params![id], |row| read_record(table, row))
        .optional()?)
}

fn write_row(conn: &Connection, record: &CacheRecord) -> Result<()> {
    let size = serde_json::to_vec(&record.payload)?.len() as u64;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} ({RECORD_COLUMNS}, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            cache_table(&record.table)
        ),
        params![
            record.id,
            record.payload,
            record.cached_at,
            record.ttl_expires_at,
            record.version,
            record.updated_at,
            record.base_payload,
            record.remote_version,
            record.remote_updated_at,
            size,
        ],
    )?;
    Ok(())
}

fn delete_row(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let n = conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", cache_table(table)),
        params![id],
    )?;
    Ok(n > 0)
}

/// JSON path selecting a top-level key, quoted so any field name is safe.
fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

/// The local cache.
#[derive(Debug)]
pub struct CacheStore {
    db: Arc<Database>,
    schema: Arc<Schema>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    counters: Counters,
    total_size_sql: String,
}

impl CacheStore {
    /// Create a store over an opened database. The database must have been
    /// opened with the same schema.
    pub fn new(db: Arc<Database>, schema: Arc<Schema>, config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        let total_size_sql = if schema.tables.is_empty() {
            "SELECT 0".to_string()
        } else {
            let parts: Vec<String> = schema
                .tables
                .keys()
                .map(|t| format!("SELECT COALESCE(SUM(size_bytes), 0) AS s FROM {}", cache_table(t)))
                .collect();
            format!("SELECT COALESCE(SUM(s), 0) FROM ({})", parts.join(" UNION ALL "))
        };
        Self {
            db,
            schema,
            config,
            clock,
            counters: Counters::default(),
            total_size_sql,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn expiry_for(&self, table: &TableSchema, now: Timestamp) -> Option<Timestamp> {
        let ttl_secs = match table.ttl_seconds {
            Some(0) => return None,
            Some(secs) => secs,
            None => self.config.ttl()?.as_secs(),
        };
        Some(now.saturating_add(ttl_secs.saturating_mul(1_000)))
    }

    /// Write a record and, unless `opts.skip_sync`, queue its upload.
    pub fn put(
        &self,
        table: &str,
        id: &str,
        payload: serde_json::Value,
        opts: PutOptions,
    ) -> Result<CacheRecord> {
        let table_schema = self.schema.require_table(table)?;
        table_schema.validate_payload(&payload)?;
        let now = self.clock.now_ms();

        self.db.transaction(|tx| {
            let existing = record_in(tx, table, id)?;
            let record = CacheRecord {
                table: table.to_string(),
                id: id.to_string(),
                payload,
                cached_at: now,
                ttl_expires_at: self.expiry_for(table_schema, now),
                version: existing.as_ref().map_or(1, |r| r.version + 1),
                updated_at: now,
                base_payload: existing.as_ref().and_then(|r| r.base_payload.clone()),
                remote_version: existing.as_ref().and_then(|r| r.remote_version),
                remote_updated_at: existing.as_ref().and_then(|r| r.remote_updated_at),
            };
            write_row(tx, &record)?;

            if !opts.skip_sync {
                let operation = if record.is_synced() {
                    Operation::Update
                } else {
                    Operation::Create
                };
                queue::enqueue_in(
                    tx,
                    NewEntry {
                        table: record.table.clone(),
                        record_id: record.id.clone(),
                        operation,
                        payload: Some(record.payload.clone()),
                        local_version: record.version,
                        remote_version: record.remote_version,
                        priority: table_schema.priority,
                    },
                    now,
                )?;
            }

            self.enforce_if_over_budget(tx, table, now)?;
            Ok(record)
        })
    }

    /// Read an unexpired record. Expired records count as a miss and are
    /// purged on the way out.
    pub fn get(&self, table: &str, id: &str) -> Result<Option<CacheRecord>> {
        self.schema.require_table(table)?;
        let now = self.clock.now_ms();

        let found = self.db.transaction(|tx| match record_in(tx, table, id)? {
            Some(record) if record.is_expired(now) => {
                // a parent stays until the children pointing at it are gone
                if self.is_unreferenced(tx, table, id)? {
                    delete_row(tx, table, id)?;
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                    debug!(table, id, "purged expired record on read");
                }
                Ok(None)
            }
            other => Ok(other),
        })?;

        let counter = if found.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    /// Read a record without touching counters or expiry.
    pub fn peek(&self, table: &str, id: &str) -> Result<Option<CacheRecord>> {
        self.schema.require_table(table)?;
        self.db.read(|conn| record_in(conn, table, id))
    }

    /// Delete a record. A record the remote has seen, or one with a queued
    /// mutation, gets a delete queued. Returns whether a row was removed.
    pub fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let table_schema = self.schema.require_table(table)?;
        let now = self.clock.now_ms();

        self.db.transaction(|tx| {
            let Some(existing) = record_in(tx, table, id)? else {
                return Ok(false);
            };
            delete_row(tx, table, id)?;

            let queued = queue::entry_for(tx, table, id)?.is_some();
            if existing.is_synced() || queued {
                queue::enqueue_in(
                    tx,
                    NewEntry {
                        table: table.to_string(),
                        record_id: id.to_string(),
                        operation: Operation::Delete,
                        payload: None,
                        local_version: existing.version + 1,
                        remote_version: existing.remote_version,
                        priority: table_schema.priority,
                    },
                    now,
                )?;
            }
            Ok(true)
        })
    }

    /// Remove a record locally without queueing anything.
    pub fn forget(&self, table: &str, id: &str) -> Result<bool> {
        self.schema.require_table(table)?;
        self.db.transaction(|tx| delete_row(tx, table, id))
    }

    /// Unexpired records of a table, most recently cached first.
    pub fn list(&self, table: &str) -> Result<Vec<CacheRecord>> {
        self.schema.require_table(table)?;
        let now = self.clock.now_ms();
        self.db.read(|conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM {}
                 WHERE ttl_expires_at IS NULL OR ttl_expires_at > ?1
                 ORDER BY cached_at DESC, id ASC",
                cache_table(table)
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![now], |row| read_record(table, row))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Records whose list field `field` contains `value` as an element.
    pub fn find_by_member(
        &self,
        table: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<CacheRecord>> {
        let def = self
            .schema
            .require_table(table)?
            .field(field)
            .ok_or_else(|| Error::InvalidPayload(format!("unknown field '{field}' in '{table}'")))?;
        if def.field_type != FieldType::List {
            return Err(Error::TypeMismatch {
                field: field.to_string(),
                expected: FieldType::List.to_string(),
                got: def.field_type.to_string(),
            });
        }

        Ok(self
            .list(table)?
            .into_iter()
            .filter(|r| {
                r.payload
                    .get(field)
                    .and_then(|v| v.as_array())
                    .is_some_and(|items| items.contains(value))
            })
            .collect())
    }

    /// Apply a record pulled from the remote.
    ///
    /// Re-applying a remote version the cache already holds changes
    /// nothing, so repeated pulls never bump the local version.
    pub fn apply_remote(&self, remote: &RemoteRecord) -> Result<RemoteApply> {
        let table_schema = self.schema.require_table(&remote.table)?;
        if !remote.deleted {
            table_schema.validate_payload(&remote.payload)?;
        }
        let now = self.clock.now_ms();
        self.db
            .transaction(|tx| self.apply_remote_in(tx, table_schema, remote, now))
    }

    /// Apply a remote record and drop the queued mutation for it, in one
    /// transaction. Used when the remote side wins outright.
    pub(crate) fn apply_remote_discarding_local(&self, remote: &RemoteRecord) -> Result<RemoteApply> {
        let table_schema = self.schema.require_table(&remote.table)?;
        if !remote.deleted {
            table_schema.validate_payload(&remote.payload)?;
        }
        let now = self.clock.now_ms();
        self.db.transaction(|tx| {
            queue::remove_in(tx, &remote.table, &remote.id)?;
            self.apply_remote_in(tx, table_schema, remote, now)
        })
    }

    fn apply_remote_in(
        &self,
        conn: &Connection,
        table_schema: &TableSchema,
        remote: &RemoteRecord,
        now: Timestamp,
    ) -> Result<RemoteApply> {
        let existing = record_in(conn, &remote.table, &remote.id)?;

        if remote.deleted {
            let removed = delete_row(conn, &remote.table, &remote.id)?;
            return Ok(if removed {
                RemoteApply::Removed
            } else {
                RemoteApply::Unchanged
            });
        }

        if let Some(current) = &existing {
            if current.remote_version.is_some_and(|v| v >= remote.version) {
                return Ok(RemoteApply::Unchanged);
            }
        }

        let record = CacheRecord {
            table: remote.table.clone(),
            id: remote.id.clone(),
            payload: remote.payload.clone(),
            cached_at: now,
            ttl_expires_at: self.expiry_for(table_schema, now),
            version: existing.as_ref().map_or(1, |r| r.version + 1),
            updated_at: now,
            base_payload: Some(remote.payload.clone()),
            remote_version: Some(remote.version),
            remote_updated_at: Some(remote.updated_at),
        };
        write_row(conn, &record)?;
        self.enforce_if_over_budget(conn, &remote.table, now)?;
        Ok(RemoteApply::Applied(record.version))
    }

    /// Record that the remote acknowledged an upload: its payload becomes
    /// the agreed base. The local version is not bumped.
    pub fn mark_synced(&self, remote: &RemoteRecord) -> Result<()> {
        self.schema.require_table(&remote.table)?;
        if remote.deleted {
            return Ok(());
        }
        self.db.transaction(|tx| {
            tx.execute(
                &format!(
                    "UPDATE {} SET base_payload = ?2, remote_version = ?3, remote_updated_at = ?4
                     WHERE id = ?1",
                    cache_table(&remote.table)
                ),
                params![remote.id, remote.payload, remote.version, remote.updated_at],
            )?;
            Ok(())
        })
    }

    /// Purge expired records, then evict until every budget holds.
    pub fn enforce_limits(&self) -> Result<EvictionReport> {
        let now = self.clock.now_ms();
        self.db.transaction(|tx| self.enforce_limits_in(tx, now, None))
    }

    /// One bounded batch of expiry and eviction.
    pub fn sweep(&self) -> Result<EvictionReport> {
        let now = self.clock.now_ms();
        let budget = self.config.eviction_batch_size;
        let report = self
            .db
            .transaction(|tx| self.enforce_limits_in(tx, now, Some(budget)))?;
        if report.total() > 0 {
            debug!(expired = report.expired, evicted = report.evicted, "cache sweep");
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let (records, size_bytes) = self.db.read(|conn| {
            let mut records = 0u64;
            for table in self.schema.tables.keys() {
                records += conn.query_row(
                    &format!("SELECT COUNT(*) FROM {}", cache_table(table)),
                    [],
                    |row| row.get::<_, u64>(0),
                )?;
            }
            let size: u64 = conn.query_row(&self.total_size_sql, [], |row| row.get(0))?;
            Ok((records, size))
        })?;
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            records,
            size_bytes,
        })
    }

    fn table_count(&self, conn: &Connection, table: &str) -> Result<u64> {
        Ok(conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", cache_table(table)),
            [],
            |row| row.get(0),
        )?)
    }

    fn total_size(&self, conn: &Connection) -> Result<u64> {
        Ok(conn.query_row(&self.total_size_sql, [], |row| row.get(0))?)
    }

    fn enforce_if_over_budget(&self, conn: &Connection, table: &str, now: Timestamp) -> Result<()> {
        if self.table_count(conn, table)? > self.config.max_records
            || self.total_size(conn)? > self.config.max_size_bytes
        {
            let report = self.enforce_limits_in(conn, now, None)?;
            debug!(
                table,
                expired = report.expired,
                evicted = report.evicted,
                "write crossed cache budget"
            );
        }
        Ok(())
    }

    pub(crate) fn enforce_limits_in(
        &self,
        conn: &Connection,
        now: Timestamp,
        budget: Option<usize>,
    ) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        let mut remaining = budget.unwrap_or(usize::MAX);

        let order = self.schema.eviction_order()?;

        // Expiry, children before parents; a referenced parent is kept
        for table in &order {
            if remaining == 0 {
                break;
            }
            let limit = i64::try_from(remaining).unwrap_or(-1);
            let name = cache_table(&table.name);
            let (refs, paths) = self.unreferenced_clause(&table.name, 2);
            let mut args = vec![SqlValue::Integer(i64::try_from(now).unwrap_or(i64::MAX))];
            args.extend(paths.into_iter().map(SqlValue::Text));
            let n = conn.execute(
                &format!(
                    "DELETE FROM {name} WHERE id IN (
                        SELECT c.id FROM {name} c
                        WHERE c.ttl_expires_at IS NOT NULL AND c.ttl_expires_at <= ?1{refs}
                        ORDER BY c.ttl_expires_at ASC, c.id ASC LIMIT {limit})"
                ),
                params_from_iter(args.iter()),
            )?;
            report.expired += n;
            remaining -= n;
        }

        // Per-table record budget, children before parents
        for table in &order {
            if remaining == 0 {
                break;
            }
            let count = self.table_count(conn, &table.name)?;
            if count <= self.config.max_records {
                continue;
            }
            let excess = usize::try_from(count - self.config.max_records).unwrap_or(usize::MAX);
            let victims = self.eviction_candidates(conn, table, excess.min(remaining))?;
            for (id, _) in &victims {
                delete_row(conn, &table.name, id)?;
            }
            report.evicted += victims.len();
            remaining -= victims.len();
        }

        // Total size budget, oldest first within each table, children first
        let mut total = self.total_size(conn)?;
        for table in &order {
            if remaining == 0 || total <= self.config.max_size_bytes {
                break;
            }
            let candidates = self.eviction_candidates(conn, table, remaining)?;
            for (id, size) in candidates {
                if total <= self.config.max_size_bytes {
                    break;
                }
                delete_row(conn, &table.name, &id)?;
                total = total.saturating_sub(size);
                report.evicted += 1;
                remaining -= 1;
            }
        }

        self.counters
            .expired
            .fetch_add(report.expired as u64, Ordering::Relaxed);
        self.counters
            .evictions
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        Ok(report)
    }

    /// `AND NOT EXISTS` filters over the row alias `c` that drop rows of
    /// `table` a cached child still references. Child field paths bind as
    /// parameters from `?first` on.
    fn unreferenced_clause(&self, table: &str, first: usize) -> (String, Vec<String>) {
        let mut sql = String::new();
        let mut paths = Vec::new();
        for child in self.schema.tables.values() {
            for fk in child.foreign_keys.iter().filter(|fk| fk.references == table) {
                sql.push_str(&format!(
                    " AND NOT EXISTS (SELECT 1 FROM {} ch WHERE json_extract(ch.payload, ?{}) = c.id)",
                    cache_table(&child.name),
                    first + paths.len()
                ));
                paths.push(json_path(&fk.field));
            }
        }
        (sql, paths)
    }

    fn is_unreferenced(&self, conn: &Connection, table: &str, id: &str) -> Result<bool> {
        let (refs, paths) = self.unreferenced_clause(table, 2);
        let mut args = vec![id.to_string()];
        args.extend(paths);
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} c WHERE c.id = ?1{refs}", cache_table(table)),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Oldest records of `table` that may be evicted: no queued mutation,
    /// and no cached record in any table still referencing them.
    fn eviction_candidates(
        &self,
        conn: &Connection,
        table: &TableSchema,
        limit: usize,
    ) -> Result<Vec<(String, u64)>> {
        let (refs, paths) = self.unreferenced_clause(&table.name, 2);
        let mut args: Vec<String> = vec![table.name.clone()];
        args.extend(paths);
        let mut sql = format!(
            "SELECT c.id, c.size_bytes FROM {} c
             WHERE NOT EXISTS (
                SELECT 1 FROM sync_queue q WHERE q.table_name = ?1 AND q.record_id = c.id){refs}",
            cache_table(&table.name)
        );
        sql.push_str(&format!(" ORDER BY c.cached_at ASC, c.id ASC LIMIT {}", i64::try_from(limit).unwrap_or(-1)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
