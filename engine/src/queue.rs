//! Durable queue of local mutations waiting to be pushed.
//!
//! The queue lives in the same SQLite database as the cache so a cache
//! write and its queue entry commit together. Retry timing is never
//! persisted: whether an entry is due again is recomputed from its attempt
//! count and last attempt time, so restarts neither shorten nor stretch a
//! backoff.

use crate::{
    clock::Clock,
    db::Database,
    error::Result,
    operation::{Coalesced, Operation},
    Error, RecordId, TableName, Timestamp, Version,
};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upload priority of a queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Ordering score: high=100, medium=50, low=10.
    pub fn score(self) -> i64 {
        match self {
            Priority::High => 100,
            Priority::Medium => 50,
            Priority::Low => 10,
        }
    }

    fn from_score(score: i64) -> Self {
        match score {
            s if s >= 100 => Priority::High,
            s if s >= 50 => Priority::Medium,
            _ => Priority::Low,
        }
    }
}

/// Lifecycle of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Conflict,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Synced => "synced",
            QueueStatus::Conflict => "conflict",
            QueueStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "syncing" => Ok(QueueStatus::Syncing),
            "synced" => Ok(QueueStatus::Synced),
            "conflict" => Ok(QueueStatus::Conflict),
            "error" => Ok(QueueStatus::Error),
            other => Err(Error::InvalidPayload(format!("unknown queue status: {other}"))),
        }
    }
}

impl ToSql for QueueStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for QueueStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for Operation {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Operation {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for Priority {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.score().into())
    }
}

impl FromSql for Priority {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(Priority::from_score)
    }
}

/// A persisted queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    pub id: String,
    pub table: TableName,
    pub record_id: RecordId,
    pub operation: Operation,
    /// Latest payload to push; `None` for deletes
    pub payload: Option<serde_json::Value>,
    /// Cache version this entry reflects
    pub local_version: Version,
    /// Remote version the push expects to replace
    pub remote_version: Option<Version>,
    pub status: QueueStatus,
    pub priority: Priority,
    pub attempt_count: u32,
    pub last_attempt_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    /// Bumped whenever a newer mutation is coalesced into the entry
    pub generation: u64,
}

/// A mutation to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub table: TableName,
    pub record_id: RecordId,
    pub operation: Operation,
    pub payload: Option<serde_json::Value>,
    pub local_version: Version,
    pub remote_version: Option<Version>,
    pub priority: Priority,
}

/// Result reported for a pushed entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The remote accepted the entry as it was at `generation` and now
    /// holds `remote_version`.
    Synced {
        generation: u64,
        remote_version: Version,
    },
    /// The push hit a true conflict; park until resolved.
    Conflict,
    /// The push failed and may be retried.
    Failed(String),
    /// The remote refused the write; stop retrying until reset.
    Rejected(String),
}

/// Entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: usize,
    pub syncing: usize,
    pub conflict: usize,
    pub error: usize,
}

/// Exponential backoff table with a cap and a retry limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    max_delay: Duration,
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            delays,
            max_delay,
            max_retries,
        }
    }

    pub fn from_config(config: &crate::SyncConfig) -> Self {
        Self::new(
            config.retry_delays.clone(),
            config.max_retry_delay,
            config.max_retries,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retrying an entry that has failed `attempts` times.
    ///
    /// The table is indexed by attempt count (clamped to its last slot),
    /// taken as a running maximum so the result never shrinks as attempts
    /// grow, and capped at the configured maximum.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 || self.delays.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempts as usize - 1).min(self.delays.len() - 1);
        self.delays[..=idx]
            .iter()
            .copied()
            .max()
            .unwrap_or_default()
            .min(self.max_delay)
    }

    /// When a pending entry may next be attempted.
    pub fn due_at(&self, entry: &SyncQueueEntry) -> Timestamp {
        match (entry.attempt_count, entry.last_attempt_at) {
            (0, _) | (_, None) => entry.created_at,
            (attempts, Some(last)) => {
                last.saturating_add(self.backoff(attempts).as_millis() as u64)
            }
        }
    }

    pub fn is_due(&self, entry: &SyncQueueEntry, now: Timestamp) -> bool {
        entry.status == QueueStatus::Pending && self.due_at(entry) <= now
    }
}

const ENTRY_COLUMNS: &str = "id, table_name, record_id, operation, payload, local_version,
    remote_version, status, priority, attempt_count, last_attempt_at, last_error, created_at,
    generation";

fn read_entry(row: &Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
    Ok(SyncQueueEntry {
        id: row.get(0)?,
        table: row.get(1)?,
        record_id: row.get(2)?,
        operation: row.get(3)?,
        payload: row.get(4)?,
        local_version: row.get(5)?,
        remote_version: row.get(6)?,
        status: row.get(7)?,
        priority: row.get(8)?,
        attempt_count: row.get(9)?,
        last_attempt_at: row.get(10)?,
        last_error: row.get(11)?,
        created_at: row.get(12)?,
        generation: row.get(13)?,
    })
}

/// Fetch the entry for a record inside an open connection or transaction.
pub(crate) fn entry_for(conn: &Connection, table: &str, record_id: &str) -> Result<Option<SyncQueueEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE table_name = ?1 AND record_id = ?2");
    Ok(conn
        .query_row(&sql, params![table, record_id], read_entry)
        .optional()?)
}

fn entry_by_id(conn: &Connection, id: &str) -> Result<Option<SyncQueueEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], read_entry).optional()?)
}

/// Upsert a mutation, coalescing with any entry already queued for the
/// record. Returns the surviving entry, or `None` if the mutations cancel.
/// The record's entry, if it changed after generation `seen` was read.
fn newer_entry(
    conn: &Connection,
    table: &str,
    record_id: &str,
    seen: Option<u64>,
) -> Result<Option<SyncQueueEntry>> {
    Ok(entry_for(conn, table, record_id)?.filter(|e| seen != Some(e.generation)))
}

fn rebase_in(conn: &Connection, id: &str, remote_version: Option<Version>) -> Result<()> {
    let n = conn.execute(
        "UPDATE sync_queue
         SET remote_version = ?2,
             status = CASE WHEN status = 'error' THEN 'error' ELSE ?3 END,
             operation = CASE
                 WHEN operation = 'delete' THEN 'delete'
                 WHEN ?2 IS NULL THEN 'create'
                 ELSE 'update'
             END
         WHERE id = ?1",
        params![id, remote_version, QueueStatus::Pending],
    )?;
    if n == 0 {
        return Err(Error::QueueEntryNotFound(id.to_string()));
    }
    Ok(())
}

pub(crate) fn enqueue_in(conn: &Connection, new: NewEntry, now: Timestamp) -> Result<Option<SyncQueueEntry>> {
    let payload = if new.operation.has_payload() {
        new.payload
    } else {
        None
    };

    let Some(existing) = entry_for(conn, &new.table, &new.record_id)? else {
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO sync_queue (id, table_name, record_id, operation, payload, local_version,
                remote_version, status, priority, attempt_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
            params![
                id,
                new.table,
                new.record_id,
                new.operation,
                payload,
                new.local_version,
                new.remote_version,
                QueueStatus::Pending,
                new.priority,
                now,
            ],
        )?;
        debug!(table = %new.table, id = %new.record_id, op = %new.operation, "queued mutation");
        return entry_by_id(conn, &id);
    };

    match existing.operation.coalesce(new.operation) {
        Coalesced::Drop => {
            conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![existing.id])?;
            debug!(table = %new.table, id = %new.record_id, "queued mutations cancelled out");
            Ok(None)
        }
        Coalesced::Keep(operation) => {
            let payload = if operation.has_payload() { payload } else { None };
            // A parked conflict stays parked; the resolver picks up the new payload.
            let status = if existing.status == QueueStatus::Conflict {
                QueueStatus::Conflict
            } else {
                QueueStatus::Pending
            };
            conn.execute(
                "UPDATE sync_queue
                 SET operation = ?2, payload = ?3, local_version = ?4,
                     remote_version = COALESCE(?5, remote_version),
                     status = ?6, priority = MAX(priority, ?7), generation = generation + 1
                 WHERE id = ?1",
                params![
                    existing.id,
                    operation,
                    payload,
                    new.local_version,
                    new.remote_version,
                    status,
                    new.priority,
                ],
            )?;
            debug!(
                table = %new.table,
                id = %new.record_id,
                from = %existing.operation,
                to = %operation,
                "coalesced queued mutation"
            );
            entry_by_id(conn, &existing.id)
        }
    }
}

pub(crate) fn remove_in(conn: &Connection, table: &str, record_id: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM sync_queue WHERE table_name = ?1 AND record_id = ?2",
        params![table, record_id],
    )?;
    Ok(n > 0)
}

/// The sync queue.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    db: Arc<Database>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    pub fn new(db: Arc<Database>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { db, policy, clock }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a mutation, coalescing with an existing entry for the record.
    pub fn enqueue(&self, entry: NewEntry) -> Result<Option<SyncQueueEntry>> {
        let now = self.clock.now_ms();
        self.db.transaction(|tx| enqueue_in(tx, entry, now))
    }

    /// Claim up to `n` due pending entries, highest priority first and
    /// oldest first within a priority. Claimed entries move to `syncing`.
    pub fn dequeue_batch(&self, n: usize) -> Result<Vec<SyncQueueEntry>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_ms();
        self.db.transaction(|tx| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE status = ?1
                 ORDER BY priority DESC, created_at ASC, id ASC"
            );
            let mut stmt = tx.prepare(&sql)?;
            let candidates = stmt
                .query_map(params![QueueStatus::Pending], read_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut batch = Vec::with_capacity(n.min(candidates.len()));
            for mut entry in candidates {
                if batch.len() == n {
                    break;
                }
                if !self.policy.is_due(&entry, now) {
                    continue;
                }
                tx.execute(
                    "UPDATE sync_queue SET status = ?2 WHERE id = ?1",
                    params![entry.id, QueueStatus::Syncing],
                )?;
                entry.status = QueueStatus::Syncing;
                batch.push(entry);
            }
            Ok(batch)
        })
    }

    /// Record the result of pushing an entry. Returns the entry's new status,
    /// or `None` when the entry no longer exists.
    pub fn mark_result(&self, id: &str, outcome: SyncOutcome) -> Result<Option<QueueStatus>> {
        let now = self.clock.now_ms();
        let max_retries = self.policy.max_retries();
        let rejected = matches!(outcome, SyncOutcome::Rejected(_));
        self.db.transaction(|tx| {
            let Some(entry) = entry_by_id(tx, id)? else {
                return Ok(None);
            };
            match outcome {
                SyncOutcome::Synced {
                    generation,
                    remote_version,
                } => {
                    if entry.generation == generation {
                        tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
                        return Ok(Some(QueueStatus::Synced));
                    }
                    // Written again while the push was in flight: push the newer
                    // payload on top of what the remote just accepted.
                    let operation = match entry.operation {
                        Operation::Create => Operation::Update,
                        other => other,
                    };
                    tx.execute(
                        "UPDATE sync_queue SET status = ?2, remote_version = ?3, operation = ?4
                         WHERE id = ?1",
                        params![id, QueueStatus::Pending, remote_version, operation],
                    )?;
                    Ok(Some(QueueStatus::Pending))
                }
                SyncOutcome::Conflict => {
                    tx.execute(
                        "UPDATE sync_queue SET status = ?2 WHERE id = ?1",
                        params![id, QueueStatus::Conflict],
                    )?;
                    Ok(Some(QueueStatus::Conflict))
                }
                SyncOutcome::Failed(reason) | SyncOutcome::Rejected(reason) => {
                    let attempts = entry.attempt_count.saturating_add(1);
                    let status = if rejected || attempts >= max_retries {
                        warn!(
                            table = %entry.table,
                            id = %entry.record_id,
                            attempts,
                            error = %reason,
                            "giving up on queued mutation until reset"
                        );
                        QueueStatus::Error
                    } else {
                        QueueStatus::Pending
                    };
                    tx.execute(
                        "UPDATE sync_queue
                         SET status = ?2, attempt_count = ?3, last_attempt_at = ?4, last_error = ?5
                         WHERE id = ?1",
                        params![id, status, attempts, now, reason],
                    )?;
                    Ok(Some(status))
                }
            }
        })
    }

    /// Point an entry at the version the remote now holds and make it
    /// pending again without counting an attempt. `None` means the remote
    /// has no such record, so a write becomes a create again. An entry in
    /// `error` keeps that status until it is reset.
    pub fn rebase(&self, id: &str, remote_version: Option<Version>) -> Result<()> {
        self.db.transaction(|tx| rebase_in(tx, id, remote_version))
    }

    /// Settle the entry of a record whose value was pushed outside the
    /// queue. `seen` is the entry generation read before the push. An entry
    /// untouched since then is removed; a newer mutation is kept and rebased
    /// onto `remote_version`. Returns whether a newer mutation was kept.
    pub fn acknowledge(
        &self,
        table: &str,
        record_id: &str,
        seen: Option<u64>,
        remote_version: Option<Version>,
    ) -> Result<bool> {
        self.db.transaction(|tx| match newer_entry(tx, table, record_id, seen)? {
            Some(newer) => {
                rebase_in(tx, &newer.id, remote_version)?;
                Ok(true)
            }
            None => {
                remove_in(tx, table, record_id)?;
                Ok(false)
            }
        })
    }

    /// Replace whatever is queued for the record with a fresh entry. A
    /// mutation queued after generation `seen` survives instead, rebased
    /// onto `entry.remote_version`.
    pub fn replace_unless_newer(&self, entry: NewEntry, seen: Option<u64>) -> Result<Option<SyncQueueEntry>> {
        let now = self.clock.now_ms();
        self.db.transaction(|tx| match newer_entry(tx, &entry.table, &entry.record_id, seen)? {
            Some(newer) => {
                rebase_in(tx, &newer.id, entry.remote_version)?;
                entry_by_id(tx, &newer.id)
            }
            None => {
                remove_in(tx, &entry.table, &entry.record_id)?;
                enqueue_in(tx, entry, now)
            }
        })
    }

    /// Move entries left `syncing` by an interrupted cycle back to `pending`.
    pub fn recover_in_flight(&self) -> Result<usize> {
        self.db.transaction(|tx| {
            Ok(tx.execute(
                "UPDATE sync_queue SET status = ?1 WHERE status = ?2",
                params![QueueStatus::Pending, QueueStatus::Syncing],
            )?)
        })
    }

    /// Manually re-arm an entry: pending, zero attempts.
    pub fn reset(&self, id: &str) -> Result<()> {
        self.db.transaction(|tx| {
            let n = tx.execute(
                "UPDATE sync_queue
                 SET status = ?2, attempt_count = 0, last_attempt_at = NULL, last_error = NULL
                 WHERE id = ?1",
                params![id, QueueStatus::Pending],
            )?;
            if n == 0 {
                return Err(Error::QueueEntryNotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Remove the entry for a record, if any.
    pub fn remove(&self, table: &str, record_id: &str) -> Result<bool> {
        self.db.transaction(|tx| remove_in(tx, table, record_id))
    }

    /// Delete `error` entries whose last attempt is older than `retention`.
    pub fn sweep_errors(&self, retention: Duration) -> Result<usize> {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(retention.as_millis() as u64);
        self.db.transaction(|tx| {
            Ok(tx.execute(
                "DELETE FROM sync_queue WHERE status = ?1 AND COALESCE(last_attempt_at, created_at) < ?2",
                params![QueueStatus::Error, cutoff],
            )?)
        })
    }

    pub fn get(&self, table: &str, record_id: &str) -> Result<Option<SyncQueueEntry>> {
        self.db.read(|conn| entry_for(conn, table, record_id))
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<SyncQueueEntry>> {
        self.db.read(|conn| entry_by_id(conn, id))
    }

    /// All entries in upload order.
    pub fn list(&self) -> Result<Vec<SyncQueueEntry>> {
        self.db.read(|conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue ORDER BY priority DESC, created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], read_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
            let mut counts = QueueCounts::default();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, QueueStatus>(0)?, row.get::<_, usize>(1)?))
            })?;
            for row in rows {
                let (status, n) = row?;
                match status {
                    QueueStatus::Pending => counts.pending = n,
                    QueueStatus::Syncing => counts.syncing = n,
                    QueueStatus::Conflict => counts.conflict = n,
                    QueueStatus::Error => counts.error = n,
                    QueueStatus::Synced => {}
                }
            }
            Ok(counts)
        })
    }

    /// Due time of every pending entry, for the retry scheduler.
    pub fn retry_schedule(&self) -> Result<Vec<(String, Timestamp)>> {
        self.db.read(|conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE status = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params![QueueStatus::Pending], read_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries
                .iter()
                .map(|e| (e.id.clone(), self.policy.due_at(e)))
                .collect())
        })
    }

    /// Earliest time any pending entry becomes due.
    pub fn next_due(&self) -> Result<Option<Timestamp>> {
        Ok(self.retry_schedule()?.into_iter().map(|(_, due)| due).min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::schema::Schema;
    use serde_json::json;

    fn setup() -> (SyncQueue, Arc<ManualClock>) {
        let db = Arc::new(Database::open_in_memory(&Schema::new(1)).unwrap());
        let clock = Arc::new(ManualClock::new(1_000));
        let policy = RetryPolicy::new(
            vec![Duration::from_secs(1), Duration::from_secs(4), Duration::from_secs(16)],
            Duration::from_secs(10),
            3,
        );
        (SyncQueue::new(db, policy, clock.clone()), clock)
    }

    fn entry(record_id: &str, operation: Operation) -> NewEntry {
        NewEntry {
            table: "notes".into(),
            record_id: record_id.into(),
            operation,
            payload: Some(json!({"body": record_id})),
            local_version: 1,
            remote_version: None,
            priority: Priority::Medium,
        }
    }

    #[test]
    fn update_then_delete_coalesces_to_delete() {
        let (queue, _) = setup();
        queue.enqueue(entry("n1", Operation::Update)).unwrap();
        queue.enqueue(entry("n1", Operation::Delete)).unwrap();

        let all = queue.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].operation, Operation::Delete);
        assert_eq!(all[0].payload, None);
    }

    #[test]
    fn create_then_update_keeps_latest_payload() {
        let (queue, _) = setup();
        queue.enqueue(entry("n1", Operation::Create)).unwrap();
        let mut update = entry("n1", Operation::Update);
        update.payload = Some(json!({"body": "edited"}));
        update.local_version = 2;
        let merged = queue.enqueue(update).unwrap().unwrap();

        assert_eq!(merged.operation, Operation::Create);
        assert_eq!(merged.payload, Some(json!({"body": "edited"})));
        assert_eq!(merged.local_version, 2);
        assert_eq!(queue.list().unwrap().len(), 1);
    }

    #[test]
    fn delete_then_create_becomes_update() {
        let (queue, _) = setup();
        queue.enqueue(entry("n1", Operation::Delete)).unwrap();
        let merged = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();
        assert_eq!(merged.operation, Operation::Update);
    }

    #[test]
    fn create_then_delete_leaves_nothing() {
        let (queue, _) = setup();
        queue.enqueue(entry("n1", Operation::Create)).unwrap();
        assert!(queue.enqueue(entry("n1", Operation::Delete)).unwrap().is_none());
        assert!(queue.list().unwrap().is_empty());
    }

    #[test]
    fn coalescing_keeps_attempt_count() {
        let (queue, _) = setup();
        let first = queue.enqueue(entry("n1", Operation::Update)).unwrap().unwrap();
        queue.dequeue_batch(1).unwrap();
        queue
            .mark_result(&first.id, SyncOutcome::Failed("offline".into()))
            .unwrap();

        let merged = queue.enqueue(entry("n1", Operation::Update)).unwrap().unwrap();
        assert_eq!(merged.attempt_count, 1);
        assert_eq!(merged.status, QueueStatus::Pending);
    }

    #[test]
    fn batch_size_limits_dequeue() {
        let (queue, _) = setup();
        for id in ["a", "b", "c"] {
            queue.enqueue(entry(id, Operation::Create)).unwrap();
        }

        let batch = queue.dequeue_batch(2).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.status == QueueStatus::Syncing));

        let counts = queue.counts().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.syncing, 2);
    }

    #[test]
    fn dequeue_orders_by_priority_then_age() {
        let (queue, clock) = setup();
        let mut low = entry("low", Operation::Create);
        low.priority = Priority::Low;
        queue.enqueue(low).unwrap();
        clock.advance(Duration::from_millis(1));
        queue.enqueue(entry("medium-old", Operation::Create)).unwrap();
        clock.advance(Duration::from_millis(1));
        queue.enqueue(entry("medium-new", Operation::Create)).unwrap();
        clock.advance(Duration::from_millis(1));
        let mut high = entry("high", Operation::Create);
        high.priority = Priority::High;
        queue.enqueue(high).unwrap();

        let order: Vec<_> = queue
            .dequeue_batch(10)
            .unwrap()
            .into_iter()
            .map(|e| e.record_id)
            .collect();
        assert_eq!(order, vec!["high", "medium-old", "medium-new", "low"]);
    }

    #[test]
    fn failure_backs_off_before_retry() {
        let (queue, clock) = setup();
        let e = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();
        queue.dequeue_batch(1).unwrap();
        let status = queue
            .mark_result(&e.id, SyncOutcome::Failed("timeout".into()))
            .unwrap();
        assert_eq!(status, Some(QueueStatus::Pending));

        // backoff(1) = 1s
        assert!(queue.dequeue_batch(1).unwrap().is_empty());
        clock.advance(Duration::from_millis(999));
        assert!(queue.dequeue_batch(1).unwrap().is_empty());
        clock.advance(Duration::from_millis(1));
        assert_eq!(queue.dequeue_batch(1).unwrap().len(), 1);
    }

    #[test]
    fn last_allowed_failure_moves_to_error() {
        let (queue, clock) = setup();
        let e = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();

        // max_retries = 3: two failures keep it pending
        for _ in 0..2 {
            assert_eq!(queue.dequeue_batch(1).unwrap().len(), 1);
            queue
                .mark_result(&e.id, SyncOutcome::Failed("offline".into()))
                .unwrap();
            clock.advance(Duration::from_secs(60));
        }
        let entry = queue.get_by_id(&e.id).unwrap().unwrap();
        assert_eq!(entry.attempt_count, 2);
        assert_eq!(entry.status, QueueStatus::Pending);

        assert_eq!(queue.dequeue_batch(1).unwrap().len(), 1);
        let status = queue
            .mark_result(&e.id, SyncOutcome::Failed("offline".into()))
            .unwrap();
        assert_eq!(status, Some(QueueStatus::Error));

        clock.advance(Duration::from_secs(3600));
        assert!(queue.dequeue_batch(1).unwrap().is_empty());

        queue.reset(&e.id).unwrap();
        assert_eq!(queue.dequeue_batch(1).unwrap().len(), 1);
    }

    #[test]
    fn synced_entry_is_removed() {
        let (queue, _) = setup();
        let e = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();
        queue.dequeue_batch(1).unwrap();
        let status = queue
            .mark_result(
                &e.id,
                SyncOutcome::Synced {
                    generation: e.generation,
                    remote_version: 1,
                },
            )
            .unwrap();
        assert_eq!(status, Some(QueueStatus::Synced));
        assert!(queue.list().unwrap().is_empty());
    }

    #[test]
    fn rejected_write_stops_retrying() {
        let (queue, _) = setup();
        let e = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();
        queue.dequeue_batch(1).unwrap();
        let status = queue
            .mark_result(&e.id, SyncOutcome::Rejected("payload too large".into()))
            .unwrap();
        assert_eq!(status, Some(QueueStatus::Error));
        let entry = queue.get_by_id(&e.id).unwrap().unwrap();
        assert_eq!(entry.last_error.as_deref(), Some("payload too large"));
    }

    #[test]
    fn write_during_push_keeps_entry_pending() {
        let (queue, _) = setup();
        let e = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();
        queue.dequeue_batch(1).unwrap();

        let mut newer = entry("n1", Operation::Update);
        newer.local_version = 2;
        queue.enqueue(newer).unwrap();

        let status = queue
            .mark_result(
                &e.id,
                SyncOutcome::Synced {
                    generation: e.generation,
                    remote_version: 7,
                },
            )
            .unwrap();
        assert_eq!(status, Some(QueueStatus::Pending));
        let entry = queue.get("notes", "n1").unwrap().unwrap();
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(entry.remote_version, Some(7));
    }

    #[test]
    fn delete_ack_keeps_recreated_record() {
        let (queue, _) = setup();
        let mut delete = entry("n1", Operation::Delete);
        delete.local_version = 2;
        delete.remote_version = Some(1);
        let e = queue.enqueue(delete).unwrap().unwrap();
        queue.dequeue_batch(1).unwrap();

        // recreated twice while the delete was in flight: the cache restarts
        // at version 1, so the new entry lands on the same local version
        let mut create = entry("n1", Operation::Create);
        create.local_version = 1;
        queue.enqueue(create).unwrap();
        let mut update = entry("n1", Operation::Create);
        update.local_version = 2;
        let current = queue.enqueue(update).unwrap().unwrap();
        assert_eq!(current.local_version, e.local_version);
        assert_eq!(current.generation, e.generation + 2);

        let status = queue
            .mark_result(
                &e.id,
                SyncOutcome::Synced {
                    generation: e.generation,
                    remote_version: 2,
                },
            )
            .unwrap();
        assert_eq!(status, Some(QueueStatus::Pending));
        let entry = queue.get("notes", "n1").unwrap().unwrap();
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(entry.remote_version, Some(2));
        assert!(entry.payload.is_some());
    }

    #[test]
    fn rebase_keeps_error_status() {
        let (queue, clock) = setup();
        let e = queue.enqueue(entry("n1", Operation::Update)).unwrap().unwrap();
        queue.dequeue_batch(1).unwrap();
        queue
            .mark_result(&e.id, SyncOutcome::Rejected("too large".into()))
            .unwrap();

        queue.rebase(&e.id, Some(3)).unwrap();
        let rebased = queue.get_by_id(&e.id).unwrap().unwrap();
        assert_eq!(rebased.status, QueueStatus::Error);
        assert_eq!(rebased.remote_version, Some(3));

        clock.advance(Duration::from_secs(3600));
        assert!(queue.dequeue_batch(1).unwrap().is_empty());
    }

    #[test]
    fn rebase_retargets_without_counting_attempt() {
        let (queue, _) = setup();
        let e = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();
        queue.dequeue_batch(1).unwrap();

        queue.rebase(&e.id, Some(4)).unwrap();
        let rebased = queue.get_by_id(&e.id).unwrap().unwrap();
        assert_eq!(rebased.status, QueueStatus::Pending);
        assert_eq!(rebased.operation, Operation::Update);
        assert_eq!(rebased.remote_version, Some(4));
        assert_eq!(rebased.attempt_count, 0);

        queue.rebase(&e.id, None).unwrap();
        assert_eq!(queue.get_by_id(&e.id).unwrap().unwrap().operation, Operation::Create);
        assert!(matches!(
            queue.rebase("missing", None),
            Err(Error::QueueEntryNotFound(_))
        ));
    }

    #[test]
    fn replace_discards_parked_entry() {
        let (queue, _) = setup();
        let e = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();
        queue.dequeue_batch(1).unwrap();
        queue.mark_result(&e.id, SyncOutcome::Conflict).unwrap();

        // a parked conflict absorbs ordinary enqueues
        let parked = queue.enqueue(entry("n1", Operation::Update)).unwrap().unwrap();
        assert_eq!(parked.status, QueueStatus::Conflict);

        let mut resolved = entry("n1", Operation::Update);
        resolved.remote_version = Some(3);
        let fresh = queue
            .replace_unless_newer(resolved, Some(parked.generation))
            .unwrap()
            .unwrap();
        assert_ne!(fresh.id, e.id);
        assert_eq!(fresh.status, QueueStatus::Pending);
        assert_eq!(fresh.operation, Operation::Update);
        assert_eq!(queue.list().unwrap().len(), 1);
    }

    #[test]
    fn acknowledge_removes_only_untouched_entry() {
        let (queue, _) = setup();
        let e = queue.enqueue(entry("n1", Operation::Update)).unwrap().unwrap();
        queue.mark_result(&e.id, SyncOutcome::Conflict).unwrap();
        assert!(!queue.acknowledge("notes", "n1", Some(e.generation), Some(3)).unwrap());
        assert!(queue.get("notes", "n1").unwrap().is_none());

        let e = queue.enqueue(entry("n2", Operation::Update)).unwrap().unwrap();
        queue.mark_result(&e.id, SyncOutcome::Conflict).unwrap();
        let mut typed = entry("n2", Operation::Update);
        typed.payload = Some(json!({"body": "typed"}));
        queue.enqueue(typed).unwrap();

        assert!(queue.acknowledge("notes", "n2", Some(e.generation), Some(3)).unwrap());
        let kept = queue.get("notes", "n2").unwrap().unwrap();
        assert_eq!(kept.status, QueueStatus::Pending);
        assert_eq!(kept.remote_version, Some(3));
        assert_eq!(kept.payload, Some(json!({"body": "typed"})));

        // nothing was queued before the push, something is now
        queue.enqueue(entry("n3", Operation::Create)).unwrap();
        assert!(queue.acknowledge("notes", "n3", None, Some(1)).unwrap());
        assert_eq!(queue.get("notes", "n3").unwrap().unwrap().operation, Operation::Update);
    }

    #[test]
    fn replace_unless_newer_keeps_later_mutation() {
        let (queue, _) = setup();
        let e = queue.enqueue(entry("n1", Operation::Update)).unwrap().unwrap();
        queue.mark_result(&e.id, SyncOutcome::Conflict).unwrap();
        let mut typed = entry("n1", Operation::Update);
        typed.payload = Some(json!({"body": "typed"}));
        queue.enqueue(typed).unwrap();

        let mut resolved = entry("n1", Operation::Update);
        resolved.payload = Some(json!({"body": "merged"}));
        resolved.remote_version = Some(5);
        let kept = queue
            .replace_unless_newer(resolved.clone(), Some(e.generation))
            .unwrap()
            .unwrap();
        assert_eq!(kept.id, e.id);
        assert_eq!(kept.payload, Some(json!({"body": "typed"})));
        assert_eq!(kept.remote_version, Some(5));

        let fresh = queue
            .replace_unless_newer(resolved, Some(kept.generation))
            .unwrap()
            .unwrap();
        assert_ne!(fresh.id, e.id);
        assert_eq!(fresh.payload, Some(json!({"body": "merged"})));
    }

    #[test]
    fn recover_in_flight_restores_pending() {
        let (queue, _) = setup();
        queue.enqueue(entry("n1", Operation::Create)).unwrap();
        queue.dequeue_batch(1).unwrap();
        assert_eq!(queue.recover_in_flight().unwrap(), 1);
        assert_eq!(queue.counts().unwrap().pending, 1);
    }

    #[test]
    fn sweep_removes_old_errors_only() {
        let (queue, clock) = setup();
        let e = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();
        queue.enqueue(entry("n2", Operation::Create)).unwrap();
        for _ in 0..3 {
            queue.dequeue_batch(10).unwrap();
            queue
                .mark_result(&e.id, SyncOutcome::Failed("bad".into()))
                .unwrap();
            queue.recover_in_flight().unwrap();
            clock.advance(Duration::from_secs(60));
        }
        assert_eq!(queue.counts().unwrap().error, 1);

        assert_eq!(queue.sweep_errors(Duration::from_secs(3600)).unwrap(), 0);
        clock.advance(Duration::from_secs(3600));
        assert_eq!(queue.sweep_errors(Duration::from_secs(3600)).unwrap(), 1);
        assert_eq!(queue.list().unwrap().len(), 1);
    }

    #[test]
    fn eligibility_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let clock = Arc::new(ManualClock::new(10_000));
        let policy = RetryPolicy::new(vec![Duration::from_secs(5)], Duration::from_secs(60), 5);

        let id = {
            let db = Arc::new(Database::open(&path, &Schema::new(1)).unwrap());
            let queue = SyncQueue::new(db, policy.clone(), clock.clone());
            let e = queue.enqueue(entry("n1", Operation::Create)).unwrap().unwrap();
            queue.dequeue_batch(1).unwrap();
            queue
                .mark_result(&e.id, SyncOutcome::Failed("offline".into()))
                .unwrap();
            e.id
        };

        clock.advance(Duration::from_secs(2));
        let db = Arc::new(Database::open(&path, &Schema::new(1)).unwrap());
        let queue = SyncQueue::new(db, policy, clock.clone());
        assert!(queue.dequeue_batch(1).unwrap().is_empty());

        let schedule = queue.retry_schedule().unwrap();
        assert_eq!(schedule, vec![(id, 15_000)]);
        assert_eq!(queue.next_due().unwrap(), Some(15_000));

        clock.advance(Duration::from_secs(3));
        assert_eq!(queue.dequeue_batch(1).unwrap().len(), 1);
    }

    #[test]
    fn backoff_is_capped_and_clamped() {
        let (queue, _) = setup();
        let policy = queue.policy();
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        // 16s capped at 10s, and later attempts reuse the last slot
        assert_eq!(policy.backoff(3), Duration::from_secs(10));
        assert_eq!(policy.backoff(50), Duration::from_secs(10));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_backoff_monotonic(
                delays in proptest::collection::vec(0u64..10_000, 1..10),
                cap in 1u64..20_000,
                n in 1u32..40,
            ) {
                let policy = RetryPolicy::new(
                    delays.into_iter().map(Duration::from_millis).collect(),
                    Duration::from_millis(cap),
                    10,
                );
                prop_assert!(policy.backoff(n) >= policy.backoff(n - 1));
                prop_assert!(policy.backoff(n) <= Duration::from_millis(cap));
            }
        }
    }
}
