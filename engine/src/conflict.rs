//! Conflict detection and the conflict/resolution log.
//!
//! A conflict exists only when both sides moved away from the last payload
//! they agreed on, and moved to different places. A one-sided change is not
//! a conflict: the side that changed wins without a record.

use crate::{
    clock::Clock, db::Database, error::Result, record::RemoteRecord, Error, RecordId, TableName,
    Timestamp, Version,
};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// How two sides relate to their common base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Both sides hold the same value
    Converged,
    /// Only the local side changed; push it
    LocalChanged,
    /// Only the remote side changed; take it
    RemoteChanged,
    /// Both sides changed to different values
    Conflict,
}

/// Compare a local and remote value against their base. An unknown base
/// is treated as `null`, i.e. "did not exist".
pub fn classify(local: &Value, remote: &Value, base: Option<&Value>) -> Divergence {
    let base = base.unwrap_or(&Value::Null);
    if local == remote {
        Divergence::Converged
    } else if remote == base {
        Divergence::LocalChanged
    } else if local == base {
        Divergence::RemoteChanged
    } else {
        Divergence::Conflict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Keys changed on both sides to different values.
pub(crate) fn conflicting_fields(local: &Value, remote: &Value, base: Option<&Value>) -> Vec<String> {
    let (Some(l), Some(r)) = (local.as_object(), remote.as_object()) else {
        return Vec::new();
    };
    let b = base.and_then(Value::as_object);
    let keys: BTreeSet<&String> = l.keys().chain(r.keys()).collect();
    keys.into_iter()
        .filter(|k| {
            let lv = l.get(*k);
            let rv = r.get(*k);
            let bv = b.and_then(|b| b.get(*k));
            lv != rv && lv != bv && rv != bv
        })
        .cloned()
        .collect()
}

/// Severity, auto-resolvability and the single conflicting field, if any.
pub(crate) fn assess(local: &Value, remote: &Value, base: Option<&Value>) -> (Severity, bool, Option<String>) {
    if local.is_null() || remote.is_null() {
        return (Severity::High, false, None);
    }
    if !(local.is_object() && remote.is_object()) {
        return (Severity::Medium, true, None);
    }
    let mut fields = conflicting_fields(local, remote, base);
    match fields.len() {
        0 => (Severity::Low, true, None),
        1 => (Severity::Low, true, fields.pop()),
        _ => (Severity::Medium, true, None),
    }
}

/// A detected conflict.
///
/// `local_value`, `remote_value` and `base_value` always hold whole
/// records; `field` names the only field both sides changed, when there is
/// exactly one. A deletion is `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub table: TableName,
    pub record_id: RecordId,
    pub field: Option<String>,
    pub local_value: Value,
    pub remote_value: Value,
    pub base_value: Option<Value>,
    pub local_timestamp: Timestamp,
    pub remote_timestamp: Timestamp,
    /// Remote version observed; the precondition for pushing a resolution
    pub remote_version: Option<Version>,
    pub severity: Severity,
    pub auto_resolvable: bool,
    pub suggested_resolution: Option<Value>,
    pub strategy_name: Option<String>,
    pub created_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}

impl ConflictRecord {
    /// Build a conflict record for values already known to conflict.
    pub fn new(
        table: &str,
        record_id: &str,
        local: &Value,
        local_timestamp: Timestamp,
        base: Option<&Value>,
        remote: &RemoteRecord,
        now: Timestamp,
    ) -> Self {
        let remote_value = remote.effective_payload();
        let (severity, auto_resolvable, field) = assess(local, &remote_value, base);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            table: table.to_string(),
            record_id: record_id.to_string(),
            field,
            local_value: local.clone(),
            remote_value,
            base_value: base.cloned(),
            local_timestamp,
            remote_timestamp: remote.updated_at,
            remote_version: Some(remote.version),
            severity,
            auto_resolvable,
            suggested_resolution: None,
            strategy_name: None,
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionKind {
    Local,
    Remote,
    Merge,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    Auto,
    User,
}

/// Append-only audit record of how a conflict was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub conflict_id: String,
    pub kind: ResolutionKind,
    pub resolved_value: Value,
    pub resolved_by: ResolvedBy,
    pub resolved_at: Timestamp,
    pub strategy_name: Option<String>,
    pub notes: Option<String>,
}

macro_rules! sql_text_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                match value.as_str()? {
                    $($text => Ok(Self::$variant),)+
                    other => Err(FromSqlError::Other(
                        format!("unknown {} '{}'", stringify!($ty), other).into(),
                    )),
                }
            }
        }
    };
}

sql_text_enum!(Severity { Low => "low", Medium => "medium", High => "high" });
sql_text_enum!(ResolutionKind {
    Local => "local",
    Remote => "remote",
    Merge => "merge",
    Custom => "custom",
});
sql_text_enum!(ResolvedBy { Auto => "auto", User => "user" });

const CONFLICT_COLUMNS: &str = "id, table_name, record_id, field, local_value, remote_value,
    base_value, local_timestamp, remote_timestamp, remote_version, severity, auto_resolvable,
    suggested_resolution, strategy_name, created_at, resolved_at";

fn read_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    Ok(ConflictRecord {
        id: row.get(0)?,
        table: row.get(1)?,
        record_id: row.get(2)?,
        field: row.get(3)?,
        local_value: row.get(4)?,
        remote_value: row.get(5)?,
        base_value: row.get(6)?,
        local_timestamp: row.get(7)?,
        remote_timestamp: row.get(8)?,
        remote_version: row.get(9)?,
        severity: row.get(10)?,
        auto_resolvable: row.get(11)?,
        suggested_resolution: row.get(12)?,
        strategy_name: row.get(13)?,
        created_at: row.get(14)?,
        resolved_at: row.get(15)?,
    })
}

fn read_resolution(row: &Row<'_>) -> rusqlite::Result<Resolution> {
    Ok(Resolution {
        conflict_id: row.get(0)?,
        kind: row.get(1)?,
        resolved_value: row.get(2)?,
        resolved_by: row.get(3)?,
        resolved_at: row.get(4)?,
        strategy_name: row.get(5)?,
        notes: row.get(6)?,
    })
}

fn conflict_by_id(conn: &Connection, id: &str) -> Result<Option<ConflictRecord>> {
    let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], read_conflict).optional()?)
}

fn open_conflict_for(conn: &Connection, table: &str, record_id: &str) -> Result<Option<ConflictRecord>> {
    let sql = format!(
        "SELECT {CONFLICT_COLUMNS} FROM conflicts
         WHERE table_name = ?1 AND record_id = ?2 AND resolved_at IS NULL"
    );
    Ok(conn
        .query_row(&sql, params![table, record_id], read_conflict)
        .optional()?)
}

/// Persistent store of conflicts and their resolutions.
#[derive(Debug, Clone)]
pub struct ConflictLog {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl ConflictLog {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Store a conflict. A record has at most one open conflict: if one is
    /// already open for the same record it is refreshed in place and keeps
    /// its id.
    pub fn record(&self, conflict: ConflictRecord) -> Result<ConflictRecord> {
        self.db.transaction(|tx| {
            let conflict = match open_conflict_for(tx, &conflict.table, &conflict.record_id)? {
                Some(open) => ConflictRecord {
                    id: open.id,
                    created_at: open.created_at,
                    ..conflict
                },
                None => conflict,
            };
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO conflicts ({CONFLICT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    conflict.id,
                    conflict.table,
                    conflict.record_id,
                    conflict.field,
                    conflict.local_value,
                    conflict.remote_value,
                    conflict.base_value,
                    conflict.local_timestamp,
                    conflict.remote_timestamp,
                    conflict.remote_version,
                    conflict.severity,
                    conflict.auto_resolvable,
                    conflict.suggested_resolution,
                    conflict.strategy_name,
                    conflict.created_at,
                    conflict.resolved_at,
                ],
            )?;
            Ok(conflict)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<ConflictRecord>> {
        self.db.read(|conn| conflict_by_id(conn, id))
    }

    pub fn open_for(&self, table: &str, record_id: &str) -> Result<Option<ConflictRecord>> {
        self.db.read(|conn| open_conflict_for(conn, table, record_id))
    }

    /// Unresolved conflicts, oldest first.
    pub fn open(&self) -> Result<Vec<ConflictRecord>> {
        self.db.read(|conn| {
            let sql = format!(
                "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE resolved_at IS NULL
                 ORDER BY created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], read_conflict)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Persist a resolution and close its conflict, atomically.
    pub fn resolve(&self, resolution: &Resolution) -> Result<()> {
        self.db.transaction(|tx| {
            let conflict = conflict_by_id(tx, &resolution.conflict_id)?
                .ok_or_else(|| Error::ConflictNotFound(resolution.conflict_id.clone()))?;
            if conflict.is_resolved() {
                return Err(Error::ConflictAlreadyResolved(conflict.id));
            }
            tx.execute(
                "INSERT INTO resolutions
                    (conflict_id, kind, resolved_value, resolved_by, resolved_at, strategy_name, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    resolution.conflict_id,
                    resolution.kind,
                    resolution.resolved_value,
                    resolution.resolved_by,
                    resolution.resolved_at,
                    resolution.strategy_name,
                    resolution.notes,
                ],
            )?;
            tx.execute(
                "UPDATE conflicts SET resolved_at = ?2 WHERE id = ?1",
                params![conflict.id, resolution.resolved_at],
            )?;
            Ok(())
        })
    }

    /// Reopen a resolved conflict against a newer remote value, e.g. when
    /// the remote rejected the resolution because it moved on meanwhile.
    pub fn reopen(&self, id: &str, local: &Value, remote: &RemoteRecord) -> Result<ConflictRecord> {
        let now = self.clock.now_ms();
        self.db.transaction(|tx| {
            let mut conflict =
                conflict_by_id(tx, id)?.ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
            let remote_value = remote.effective_payload();
            let (severity, auto_resolvable, field) =
                assess(local, &remote_value, conflict.base_value.as_ref());
            conflict.local_value = local.clone();
            conflict.local_timestamp = now;
            conflict.remote_value = remote_value;
            conflict.remote_timestamp = remote.updated_at;
            conflict.remote_version = Some(remote.version);
            conflict.severity = severity;
            conflict.auto_resolvable = auto_resolvable;
            conflict.field = field;
            conflict.suggested_resolution = None;
            conflict.resolved_at = None;
            tx.execute(
                "UPDATE conflicts
                 SET local_value = ?2, local_timestamp = ?3, remote_value = ?4,
                     remote_timestamp = ?5, remote_version = ?6, severity = ?7,
                     auto_resolvable = ?8, field = ?9, suggested_resolution = NULL,
                     resolved_at = NULL
                 WHERE id = ?1",
                params![
                    conflict.id,
                    conflict.local_value,
                    conflict.local_timestamp,
                    conflict.remote_value,
                    conflict.remote_timestamp,
                    conflict.remote_version,
                    conflict.severity,
                    conflict.auto_resolvable,
                    conflict.field,
                ],
            )?;
            Ok(conflict)
        })
    }

    /// Drop resolved conflicts. Their resolutions stay in the audit log.
    pub fn clear_resolved(&self) -> Result<usize> {
        self.db
            .transaction(|tx| Ok(tx.execute("DELETE FROM conflicts WHERE resolved_at IS NOT NULL", [])?))
    }

    /// Resolutions recorded for a conflict, in the order they were made.
    pub fn resolutions_for(&self, conflict_id: &str) -> Result<Vec<Resolution>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conflict_id, kind, resolved_value, resolved_by, resolved_at, strategy_name, notes
                 FROM resolutions WHERE conflict_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map(params![conflict_id], read_resolution)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
